//! Turning dump file contents into statements the server will accept.

use std::borrow::Cow;
use tracing::warn;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lexer {
    Normal,
    Quoted(u8),
    LineComment,
    BlockComment,
}

/// A `;` ends a statement only when nothing but whitespace follows it on its line.
fn ends_line(bytes: &[u8], from: usize) -> bool {
    for &b in &bytes[from..] {
        match b {
            b'\n' => return true,
            b' ' | b'\t' | b'\r' => continue,
            _ => return false,
        }
    }
    true
}

/// Drops leading `--`/`#` comment lines and plain `/* */` comments.
/// Executable `/*! */` comments are kept.
fn strip_leading_comments(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start();
        if sql.starts_with("--") || sql.starts_with('#') {
            sql = sql.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
        } else if sql.starts_with("/*") && !sql.starts_with("/*!") {
            sql = sql.split_once("*/").map(|(_, rest)| rest).unwrap_or("");
        } else {
            return sql;
        }
    }
}

/// Splits a dump file into statements, without their terminating `;`.
///
/// Quotes and comments are honoured, so a `;` inside a string or comment
/// never ends a statement. Statements that are only comments are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut push = |text: &str| {
        let text = strip_leading_comments(text).trim_end();
        if !text.is_empty() {
            statements.push(text.to_string());
        }
    };

    let mut state = Lexer::Normal;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match state {
            Lexer::Normal => match b {
                b'\'' | b'"' | b'`' => state = Lexer::Quoted(b),
                b'#' => state = Lexer::LineComment,
                b'-' if bytes.get(i + 1) == Some(&b'-')
                    && bytes.get(i + 2).map_or(true, |c| c.is_ascii_whitespace()) =>
                {
                    state = Lexer::LineComment;
                    i += 1;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    state = Lexer::BlockComment;
                    i += 1;
                }
                b';' if ends_line(bytes, i + 1) => {
                    push(&sql[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
            Lexer::Quoted(quote) => {
                if b == b'\\' && quote != b'`' {
                    i += 1;
                } else if b == quote {
                    if bytes.get(i + 1) == Some(&quote) {
                        i += 1;
                    } else {
                        state = Lexer::Normal;
                    }
                }
            }
            Lexer::LineComment => {
                if b == b'\n' {
                    state = Lexer::Normal;
                }
            }
            Lexer::BlockComment => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    state = Lexer::Normal;
                    i += 1;
                }
            }
        }
        i += 1;
    }
    push(&sql[start.min(sql.len())..]);
    statements
}

fn is_insert(sql: &str) -> bool {
    let head = sql.trim_start();
    ["INSERT", "REPLACE"].iter().any(|kw| {
        head.get(..kw.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(kw))
    })
}

/// Byte offset just past the `VALUES` keyword, found outside quotes.
fn values_end(sql: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' && q != b'`' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b'V' | b'v' => {
                    let word = sql.get(i..i + 6).unwrap_or_default();
                    let before = i.checked_sub(1).map(|p| bytes[p]);
                    let after = bytes.get(i + 6).copied();
                    if word.eq_ignore_ascii_case("VALUES")
                        && before.is_some_and(|c| c.is_ascii_whitespace() || c == b')')
                        && after.map_or(true, |c| c.is_ascii_whitespace() || c == b'(')
                    {
                        return Some(i + 6);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Splits `rows` (the text after `VALUES`) into row tuples and the trailing
/// clause, e.g. `ON DUPLICATE KEY UPDATE ...`.
fn parse_rows(rows: &str) -> Option<(Vec<&str>, &str)> {
    let bytes = rows.as_bytes();
    let mut tuples = Vec::new();
    let mut i = 0;
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if bytes.get(i) != Some(&b'(') {
            return None;
        }
        let start = i;
        let mut depth = 0usize;
        let mut quote = None;
        loop {
            let b = *bytes.get(i)?;
            match quote {
                Some(q) => {
                    if b == b'\\' && q != b'`' {
                        i += 1;
                    } else if b == q {
                        quote = None;
                    }
                }
                None => match b {
                    b'\'' | b'"' | b'`' => quote = Some(b),
                    b'(' => depth += 1,
                    b')' => {
                        depth -= 1;
                        if depth == 0 {
                            i += 1;
                            break;
                        }
                    }
                    _ => {}
                },
            }
            i += 1;
        }
        tuples.push(&rows[start..i]);

        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if bytes.get(i) == Some(&b',') {
            i += 1;
            continue;
        }
        return Some((tuples, rows[i..].trim()));
    }
}

/// Cuts a statement larger than `max_size` into smaller ones.
///
/// Only multi-row `INSERT`/`REPLACE ... VALUES` statements can be cut; they
/// are split between rows and every piece repeats the statement header and any
/// trailing clause. A single row larger than `max_size` is sent on its own.
/// Anything else is returned unchanged.
pub fn fit_statement(sql: String, max_size: usize) -> Vec<String> {
    if sql.len() <= max_size {
        return vec![sql];
    }
    if !is_insert(&sql) {
        warn!(size = sql.len(), max_size, "statement exceeds the query size limit and cannot be split");
        return vec![sql];
    }
    let Some(header_end) = values_end(&sql) else {
        return vec![sql];
    };
    let Some((rows, suffix)) = parse_rows(&sql[header_end..]) else {
        warn!(size = sql.len(), "could not find row boundaries, sending insert unsplit");
        return vec![sql];
    };

    let header = sql[..header_end].trim_end();
    let fixed = header.len() + 1 + if suffix.is_empty() { 0 } else { suffix.len() + 1 };
    let finish = |rows: &str| {
        let mut out = String::with_capacity(fixed + rows.len());
        out.push_str(header);
        out.push(' ');
        out.push_str(rows);
        if !suffix.is_empty() {
            out.push(' ');
            out.push_str(suffix);
        }
        out
    };

    let mut pieces = Vec::new();
    let mut batch = String::new();
    for row in rows {
        let extra = if batch.is_empty() { row.len() } else { row.len() + 1 };
        if !batch.is_empty() && fixed + batch.len() + extra > max_size {
            pieces.push(finish(&batch));
            batch.clear();
        }
        if !batch.is_empty() {
            batch.push(',');
        }
        batch.push_str(row);
        if fixed + batch.len() > max_size {
            warn!(size = fixed + batch.len(), max_size, "a single row exceeds the query size limit");
        }
    }
    if !batch.is_empty() {
        pieces.push(finish(&batch));
    }
    pieces
}

/// Quotes an identifier with backticks, doubling any it contains.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Rewrites `` `from`. `` qualifiers to `` `to`. ``.
///
/// For inserts only the header before the first `(` is touched, so row data
/// that happens to contain the qualifier is left alone.
pub fn retarget<'a>(sql: &'a str, from: &str, to: &str) -> Cow<'a, str> {
    let needle = format!("`{}`.", from);
    let limit = if is_insert(sql) {
        sql.find('(').unwrap_or(sql.len())
    } else {
        sql.len()
    };
    if !sql[..limit].contains(&needle) {
        return Cow::Borrowed(sql);
    }
    let replacement = format!("`{}`.", to);
    Cow::Owned(format!("{}{}", sql[..limit].replace(&needle, &replacement), &sql[limit..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_respects_quotes_and_comments() {
        let sql = "/*!40101 SET NAMES binary*/;\n\
                   -- a comment; with a semicolon\n\
                   INSERT INTO `t` VALUES (1,'a;\nb'),(2,\"x\");\n\
                   /* plain; comment */\n\
                   INSERT INTO `t` VALUES (3,'it''s');";
        let statements = split_statements(sql);
        assert_eq!(
            statements,
            vec![
                "/*!40101 SET NAMES binary*/".to_string(),
                "INSERT INTO `t` VALUES (1,'a;\nb'),(2,\"x\")".to_string(),
                "INSERT INTO `t` VALUES (3,'it''s')".to_string(),
            ]
        );
    }

    #[test]
    fn test_semicolon_mid_line_does_not_split() {
        let statements = split_statements("SET a=1; SET b=2;\nSELECT 1");
        assert_eq!(statements, vec!["SET a=1; SET b=2", "SELECT 1"]);
    }

    #[test]
    fn test_escaped_quote_does_not_end_string() {
        let statements = split_statements("INSERT INTO t VALUES ('a\\';\n');\n");
        assert_eq!(statements.len(), 1);
    }

    #[test]
    fn test_small_statement_is_untouched() {
        let sql = "INSERT INTO `t` VALUES (1),(2)".to_string();
        assert_eq!(fit_statement(sql.clone(), 1024), vec![sql]);
    }

    #[test]
    fn test_split_keeps_trailing_clause() {
        let sql = "INSERT INTO `t` (`id`,`n`) VALUES (1,2),(3,4),(5,6) ON DUPLICATE KEY UPDATE n=VALUES(n)";
        let pieces = fit_statement(sql.to_string(), 80);
        assert_eq!(pieces.len(), 3);
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(piece.starts_with("INSERT INTO `t` (`id`,`n`) VALUES ("));
            assert!(piece.ends_with("ON DUPLICATE KEY UPDATE n=VALUES(n)"));
        }
    }

    #[test]
    fn test_oversize_row_is_sent_alone() {
        let big = "x".repeat(100);
        let sql = format!("INSERT INTO t VALUES (1),('{}'),(2)", big);
        let pieces = fit_statement(sql, 40);
        assert_eq!(pieces.len(), 3);
        assert!(pieces[1].contains(&big));
    }

    #[test]
    fn test_non_insert_is_never_split() {
        let sql = format!("CREATE TABLE t (c varchar(10) DEFAULT '{}')", "y".repeat(50));
        assert_eq!(fit_statement(sql.clone(), 10), vec![sql]);
    }

    #[test]
    fn test_quote_ident_doubles_backticks() {
        assert_eq!(quote_ident("users"), "`users`");
        assert_eq!(quote_ident("odd`name"), "`odd``name`");
    }

    #[test]
    fn test_retarget_only_touches_header() {
        let sql = "INSERT INTO `legacy`.`t` VALUES ('`legacy`.x')";
        assert_eq!(
            retarget(sql, "legacy", "shop"),
            "INSERT INTO `shop`.`t` VALUES ('`legacy`.x')"
        );
        let view = "CREATE VIEW `v` AS SELECT * FROM `legacy`.`t` JOIN `legacy`.`u`";
        assert_eq!(
            retarget(view, "legacy", "shop"),
            "CREATE VIEW `v` AS SELECT * FROM `shop`.`t` JOIN `shop`.`u`"
        );
        assert!(matches!(retarget("SELECT 1", "legacy", "shop"), Cow::Borrowed(_)));
    }

    fn arb_row() -> impl Strategy<Value = String> {
        (any::<i32>(), "[a-z ,;()']{0,24}").prop_map(|(id, text)| {
            format!("({},'{}')", id, text.replace('\'', "''"))
        })
    }

    proptest! {
        #[test]
        fn split_inserts_preserve_rows(
            rows in prop::collection::vec(arb_row(), 1..40),
            max_size in 40usize..400,
        ) {
            let header = "INSERT INTO `orders` VALUES";
            let sql = format!("{} {}", header, rows.join(","));
            let pieces = fit_statement(sql, max_size);

            let mut replayed = Vec::new();
            for piece in &pieces {
                prop_assert!(piece.starts_with(header));
                let (piece_rows, suffix) = parse_rows(&piece[header.len()..]).unwrap();
                prop_assert!(suffix.is_empty());
                prop_assert!(piece.len() <= max_size || piece_rows.len() == 1);
                replayed.extend(piece_rows.into_iter().map(str::to_string));
            }
            prop_assert_eq!(replayed, rows);
        }
    }
}
