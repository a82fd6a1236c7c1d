use crate::logging::LogFormat;
use crate::orchestrator::RestoreRequest;
use crate::settings::{ApiSettings, RestoreSettings};
use branchdump_broker::{ApiConfig, BrokerOptions};
use branchdump_core::{BranchRef, RestoreConfig, RestoreError, Result, Secret, TableRange};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "branchdump", author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML settings file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    pub debug: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    /// Organization that owns the database
    #[arg(long, env = "BRANCHDUMP_ORG", global = true)]
    pub org: Option<String>,

    #[arg(long, env = "BRANCHDUMP_SERVICE_TOKEN_ID", global = true)]
    pub service_token_id: Option<String>,

    #[arg(long, env = "BRANCHDUMP_SERVICE_TOKEN", global = true, hide_env_values = true)]
    pub service_token: Option<String>,

    /// Management API base URL
    #[arg(long, env = "BRANCHDUMP_API_URL", global = true)]
    pub api_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Restore a mydumper-style dump into a database branch
    RestoreDump(RestoreArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    /// Destination database
    pub database: String,

    /// Destination branch
    pub branch: String,

    /// Directory containing the dump files
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Drop tables that already exist before restoring them
    #[arg(long)]
    pub overwrite_tables: bool,

    /// Only restore table and view definitions
    #[arg(long)]
    pub schema_only: bool,

    /// Only restore rows into existing tables
    #[arg(long)]
    pub data_only: bool,

    /// Log every file as it is restored
    #[arg(long)]
    pub show_details: bool,

    /// First table to restore, inclusive
    #[arg(long)]
    pub starting_table: Option<String>,

    /// Last table to restore, inclusive
    #[arg(long)]
    pub ending_table: Option<String>,

    /// Restore a dump taken from a database with a different name
    #[arg(long)]
    pub allow_different_destination: bool,

    /// Largest statement sent to the server, in bytes
    #[arg(long)]
    pub max_query_size: Option<usize>,

    /// Number of concurrent loader connections
    #[arg(long)]
    pub threads: Option<usize>,

    /// Address the local relay listens on
    #[arg(long)]
    pub local_addr: Option<String>,

    /// Branch endpoint to relay to instead of the credential's host
    #[arg(long)]
    pub remote_addr: Option<String>,
}

impl Cli {
    pub fn organization(&self, settings: &ApiSettings) -> Result<String> {
        self.org
            .clone()
            .or_else(|| settings.organization.clone())
            .ok_or_else(|| RestoreError::Validation("organization is missing, set --org or BRANCHDUMP_ORG".into()))
    }

    pub fn api_config(&self, settings: &ApiSettings) -> Result<ApiConfig> {
        let token_id = self
            .service_token_id
            .clone()
            .or_else(|| settings.token_id.clone())
            .ok_or_else(|| RestoreError::Validation("service token id is missing".into()))?;
        let token = self
            .service_token
            .clone()
            .or_else(|| settings.token.clone())
            .ok_or_else(|| RestoreError::Validation("service token is missing".into()))?;

        let mut config = ApiConfig::new(token_id, Secret::new(token));
        if let Some(url) = self.api_url.clone().or_else(|| settings.base_url.clone()) {
            config.base_url = url;
        }
        if let Some(secs) = settings.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

impl RestoreArgs {
    pub fn restore_config(&self, settings: &RestoreSettings) -> RestoreConfig {
        RestoreConfig {
            source_dir: self.dir.clone().unwrap_or_default(),
            overwrite_tables: self.overwrite_tables,
            schema_only: self.schema_only,
            data_only: self.data_only,
            show_details: self.show_details,
            tables: TableRange::new(self.starting_table.clone(), self.ending_table.clone()),
            allow_different_destination: self.allow_different_destination,
            max_query_size: self.max_query_size.unwrap_or(settings.max_query_size),
            workers: self.threads.unwrap_or(settings.threads),
            database: self.database.clone(),
            poll_interval_ms: settings.poll_interval_ms,
        }
    }

    pub fn request(&self, organization: String, settings: &RestoreSettings) -> RestoreRequest {
        let branch = BranchRef::new(organization, self.database.clone(), self.branch.clone());
        let mut request = RestoreRequest::new(branch, self.restore_config(settings));
        request.local_addr = self.local_addr.clone().unwrap_or_else(|| settings.local_addr.clone());
        request.remote_addr = self.remote_addr.clone();
        request.credential_ttl = Duration::from_secs(settings.credential_ttl_secs);
        request.connect_timeout = Duration::from_secs(settings.connect_timeout_secs);
        request
    }
}

pub fn broker_options(settings: &RestoreSettings) -> BrokerOptions {
    BrokerOptions {
        revoke_timeout: Duration::from_secs(settings.revoke_timeout_secs),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restore_args(extra: &[&str]) -> (Cli, RestoreArgs) {
        let mut argv = vec!["branchdump", "--org", "acme", "restore-dump", "shop", "main"];
        argv.extend_from_slice(extra);
        let cli = Cli::try_parse_from(argv).unwrap();
        let Command::RestoreDump(args) = &cli.command;
        let args = args.clone();
        (cli, args)
    }

    #[test]
    fn test_flags_override_settings() {
        let (_, args) = restore_args(&["--dir", "/tmp/dump", "--threads", "4", "--starting-table", "logs"]);
        let settings = RestoreSettings {
            threads: 2,
            max_query_size: 1024,
            ..Default::default()
        };

        let config = args.restore_config(&settings);
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_query_size, 1024);
        assert_eq!(config.database, "shop");
        assert_eq!(config.tables, TableRange::new(Some("logs".into()), None));
        assert_eq!(config.source_dir, PathBuf::from("/tmp/dump"));
    }

    #[test]
    fn test_missing_dir_fails_validation() {
        let (_, args) = restore_args(&[]);
        let err = args.restore_config(&RestoreSettings::default()).validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation Error: --dir flag is missing, it's needed to restore the database"
        );
    }

    #[test]
    fn test_request_targets_branch() {
        let (cli, args) = restore_args(&["--dir", "d", "--local-addr", "127.0.0.1:3307"]);
        let org = cli.organization(&ApiSettings::default()).unwrap();
        let request = args.request(org, &RestoreSettings::default());
        assert_eq!(request.branch, BranchRef::new("acme", "shop", "main"));
        assert_eq!(request.local_addr, "127.0.0.1:3307");
        assert_eq!(request.credential_ttl, Duration::from_secs(300));
        assert_eq!(request.connect_timeout, Duration::from_secs(10));
        assert_eq!(request.role, "admin");
    }

    #[test]
    fn test_api_config_needs_token() {
        let (cli, _) = restore_args(&[]);
        let settings = ApiSettings {
            token_id: Some("id".into()),
            ..Default::default()
        };
        assert!(matches!(cli.api_config(&settings), Err(RestoreError::Validation(_))));

        let settings = ApiSettings {
            token_id: Some("id".into()),
            token: Some("secret".into()),
            base_url: Some("http://localhost:9000/v1".into()),
            ..Default::default()
        };
        let config = cli.api_config(&settings).unwrap();
        assert_eq!(config.base_url, "http://localhost:9000/v1");
        assert_eq!(config.token.expose(), "secret");
    }
}
