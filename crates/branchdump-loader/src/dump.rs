//! Dump directory layout.
//!
//! ```text
//! <db>-schema-create.sql         database definition (not replayed)
//! <db>.<table>-schema.sql        table definition
//! <db>.<table>.<NNNNN>.sql       data chunk, replayed in numeric order
//! <db>.<view>-schema-view.sql    view definition, replayed after all tables
//! ```

use branchdump_core::{RestoreError, Result, TableRange};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFiles {
    pub name: String,
    pub schema: Option<PathBuf>,
    /// Data chunks in replay order.
    pub data: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewFile {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct DumpLayout {
    pub dir: PathBuf,
    /// Database names the files were dumped from.
    pub databases: BTreeSet<String>,
    /// Tables sorted by name.
    pub tables: Vec<TableFiles>,
    pub views: Vec<ViewFile>,
}

enum DumpFile {
    DatabaseSchema { database: String },
    TableSchema { database: String, table: String },
    ViewSchema { database: String, view: String },
    Data { database: String, table: String, chunk: u64 },
}

fn split_qualified(name: &str) -> Option<(String, String)> {
    let (database, object) = name.split_once('.')?;
    if database.is_empty() || object.is_empty() {
        return None;
    }
    Some((database.to_string(), object.to_string()))
}

fn classify(file_name: &str) -> Option<DumpFile> {
    let stem = file_name.strip_suffix(".sql")?;
    if let Some(database) = stem.strip_suffix("-schema-create") {
        return Some(DumpFile::DatabaseSchema {
            database: database.to_string(),
        });
    }
    if let Some(name) = stem.strip_suffix("-schema-view") {
        let (database, view) = split_qualified(name)?;
        return Some(DumpFile::ViewSchema { database, view });
    }
    if let Some(name) = stem.strip_suffix("-schema") {
        let (database, table) = split_qualified(name)?;
        return Some(DumpFile::TableSchema { database, table });
    }
    // Triggers, post-data objects and other schema extras are not replayed.
    if stem.contains("-schema") {
        return None;
    }
    let (database, rest) = split_qualified(stem)?;
    // `<table>.<chunk>` or a single unnumbered `<table>`.
    let (table, chunk) = match rest.rsplit_once('.') {
        Some((table, chunk)) if !chunk.is_empty() && chunk.bytes().all(|b| b.is_ascii_digit()) => {
            (table.to_string(), chunk.parse().ok()?)
        }
        _ => (rest.clone(), 0),
    };
    Some(DumpFile::Data {
        database,
        table,
        chunk,
    })
}

impl DumpLayout {
    /// Reads the directory listing. File contents are not opened.
    pub fn scan(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            RestoreError::Validation(format!("cannot read dump directory {}: {}", dir.display(), e))
        })?;

        let mut databases = BTreeSet::new();
        let mut tables: BTreeMap<String, (Option<PathBuf>, Vec<(u64, PathBuf)>)> = BTreeMap::new();
        let mut views = BTreeMap::new();

        for entry in entries {
            let entry = entry.map_err(|e| {
                RestoreError::Validation(format!("cannot read dump directory {}: {}", dir.display(), e))
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match classify(file_name) {
                Some(DumpFile::DatabaseSchema { database }) => {
                    databases.insert(database);
                }
                Some(DumpFile::TableSchema { database, table }) => {
                    databases.insert(database);
                    tables.entry(table).or_default().0 = Some(path);
                }
                Some(DumpFile::ViewSchema { database, view }) => {
                    databases.insert(database);
                    views.insert(view, path);
                }
                Some(DumpFile::Data {
                    database,
                    table,
                    chunk,
                }) => {
                    databases.insert(database);
                    tables.entry(table).or_default().1.push((chunk, path));
                }
                None => debug!(file = %file_name, "skipping file outside the dump layout"),
            }
        }

        if tables.is_empty() && views.is_empty() {
            return Err(RestoreError::Validation(format!(
                "no schema or data files found in {}",
                dir.display()
            )));
        }

        let tables = tables
            .into_iter()
            .map(|(name, (schema, mut chunks))| {
                chunks.sort();
                TableFiles {
                    name,
                    schema,
                    data: chunks.into_iter().map(|(_, path)| path).collect(),
                }
            })
            .collect();
        let views = views
            .into_iter()
            .map(|(name, path)| ViewFile { name, path })
            .collect();

        Ok(Self {
            dir: dir.to_path_buf(),
            databases,
            tables,
            views,
        })
    }

    /// Fails unless every file was dumped from `target`, when names must match.
    pub fn check_destination(&self, target: &str, allow_different: bool) -> Result<()> {
        if allow_different {
            return Ok(());
        }
        match self.databases.iter().find(|db| db.as_str() != target) {
            Some(db) => Err(RestoreError::Validation(format!(
                "dump was taken from database {} but the destination is {}; use --allow-different-destination to restore it anyway",
                db, target
            ))),
            None => Ok(()),
        }
    }

    pub fn select_tables(&self, range: &TableRange) -> Vec<TableFiles> {
        self.tables
            .iter()
            .filter(|t| range.contains(&t.name))
            .cloned()
            .collect()
    }

    pub fn select_views(&self, range: &TableRange) -> Vec<ViewFile> {
        self.views
            .iter()
            .filter(|v| range.contains(&v.name))
            .cloned()
            .collect()
    }
}
