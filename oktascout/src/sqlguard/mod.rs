//! Static safety validation of model-written SQL before it touches the
//! snapshot.
//!
//! The guard tokenizes the statement (string literals, quoted identifiers
//! and comments are lexed, never pattern-matched), then enforces:
//!
//! - exactly one statement, root SELECT (or CTE resolving to SELECT),
//! - no DDL/DML/PRAGMA/ATTACH and friends anywhere, quoted names exempt,
//! - no comments at all (comment smuggling is rejected outright),
//! - an explicit function allowlist,
//! - a mandatory top-level row limit: injected when absent, clamped when
//!   above the cap.
//!
//! The executor additionally opens the snapshot read-only, so the guard is
//! the first fence, not the only one.

mod lexer;

use lexer::{tokenize, Token, TokenKind};
use thiserror::Error;

/// Stable reason categories for a rejected statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlGuardErrorKind {
    Empty,
    MultipleStatements,
    NotSelect,
    ForbiddenKeyword,
    ForbiddenFunction,
    CommentNotAllowed,
    UnbalancedQuote,
    BadLimit,
}

impl SqlGuardErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlGuardErrorKind::Empty => "empty_statement",
            SqlGuardErrorKind::MultipleStatements => "multiple_statements",
            SqlGuardErrorKind::NotSelect => "not_select",
            SqlGuardErrorKind::ForbiddenKeyword => "forbidden_keyword",
            SqlGuardErrorKind::ForbiddenFunction => "forbidden_function",
            SqlGuardErrorKind::CommentNotAllowed => "comment_not_allowed",
            SqlGuardErrorKind::UnbalancedQuote => "unbalanced_quote",
            SqlGuardErrorKind::BadLimit => "bad_limit",
        }
    }
}

#[derive(Clone, Debug, Error)]
#[error("{}: {reason}", kind.as_str())]
pub struct SqlGuardError {
    pub kind: SqlGuardErrorKind,
    pub reason: String,
}

impl SqlGuardError {
    fn new(kind: SqlGuardErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Outcome of a successful validation.
#[derive(Clone, Debug)]
pub struct ValidatedSql {
    /// Trimmed statement with the row limit injected or clamped.
    pub normalized_sql: String,
    pub warnings: Vec<String>,
}

/// Statement-level words that end validation immediately.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "replace", "drop", "create", "alter", "pragma", "vacuum",
    "attach", "detach", "reindex", "analyze", "begin", "commit", "rollback", "savepoint",
    "release", "grant", "revoke", "explain",
];

/// Words that legitimately precede `(` without being function calls.
const PAREN_KEYWORDS: &[&str] = &[
    "select", "from", "where", "and", "or", "not", "in", "exists", "on", "using", "join", "as",
    "when", "then", "else", "case", "end", "cast", "between", "like", "glob", "is", "values",
    "union", "all", "except", "intersect", "distinct", "group", "order", "by", "having", "limit",
    "offset", "with", "recursive", "over", "partition", "filter", "window", "collate", "escape",
    "left", "right", "inner", "outer", "cross", "natural", "asc", "desc",
];

/// Callable functions the guard accepts. Everything else is rejected by
/// name, which covers `load_extension`, `readfile`, `fts3_tokenizer` and any
/// extension the snapshot might have loaded.
const ALLOWED_FUNCTIONS: &[&str] = &[
    // aggregates
    "count", "sum", "avg", "min", "max", "total", "group_concat",
    // scalar text
    "length", "lower", "upper", "substr", "substring", "trim", "ltrim", "rtrim", "replace",
    "instr", "printf", "format", "quote", "hex", "unicode", "char",
    // scalar numeric / misc
    "abs", "round", "coalesce", "ifnull", "nullif", "iif", "typeof", "sign", "ceil", "ceiling",
    "floor", "mod", "pow", "power", "sqrt", "exp", "ln", "log", "log2", "log10", "random",
    // date & time
    "date", "time", "datetime", "julianday", "strftime", "unixepoch", "timediff",
    // JSON
    "json", "json_extract", "json_array", "json_array_length", "json_object", "json_type",
    "json_valid", "json_each", "json_tree",
    // window
    "row_number", "rank", "dense_rank", "ntile", "lag", "lead", "first_value", "last_value",
    "nth_value", "cume_dist", "percent_rank",
];

/// Validates one SQL string and enforces `row_cap` on its top-level limit.
pub fn validate_sql(sql: &str, row_cap: usize) -> Result<ValidatedSql, SqlGuardError> {
    let tokens = tokenize(sql)?;
    if tokens.is_empty() {
        return Err(SqlGuardError::new(
            SqlGuardErrorKind::Empty,
            "statement contains no tokens",
        ));
    }

    check_single_statement(&tokens)?;
    let tokens = strip_trailing_semicolon(tokens);
    check_root_is_select(&tokens)?;
    check_keywords(&tokens)?;
    check_functions(&tokens)?;
    apply_row_limit(sql, &tokens, row_cap)
}

fn check_single_statement(tokens: &[Token]) -> Result<(), SqlGuardError> {
    for (i, tok) in tokens.iter().enumerate() {
        if tok.kind == TokenKind::Punct && tok.text == ";" && i + 1 < tokens.len() {
            return Err(SqlGuardError::new(
                SqlGuardErrorKind::MultipleStatements,
                "multiple statements",
            ));
        }
    }
    Ok(())
}

fn strip_trailing_semicolon(mut tokens: Vec<Token>) -> Vec<Token> {
    if tokens
        .last()
        .is_some_and(|t| t.kind == TokenKind::Punct && t.text == ";")
    {
        tokens.pop();
    }
    tokens
}

fn check_root_is_select(tokens: &[Token]) -> Result<(), SqlGuardError> {
    let Some(first) = tokens.first() else {
        return Err(SqlGuardError::new(
            SqlGuardErrorKind::Empty,
            "statement contains no tokens",
        ));
    };
    let is_word = first.kind == TokenKind::Word && !first.quoted;
    let root = first.text.to_lowercase();
    if !is_word || (root != "select" && root != "with") {
        return Err(SqlGuardError::new(
            SqlGuardErrorKind::NotSelect,
            format!("statement must start with SELECT or WITH, found `{}`", first.text),
        ));
    }
    if root == "with" {
        // The CTE bodies sit inside parens; the main statement's SELECT must
        // appear at depth 0.
        let mut depth = 0i32;
        let mut found = false;
        for tok in &tokens[1..] {
            match (tok.kind, tok.text.as_str()) {
                (TokenKind::Punct, "(") => depth += 1,
                (TokenKind::Punct, ")") => depth -= 1,
                (TokenKind::Word, _) if !tok.quoted && depth == 0 => {
                    if tok.text.eq_ignore_ascii_case("select") {
                        found = true;
                        break;
                    }
                }
                _ => {}
            }
        }
        if !found {
            return Err(SqlGuardError::new(
                SqlGuardErrorKind::NotSelect,
                "WITH clause does not resolve to a top-level SELECT",
            ));
        }
    }
    Ok(())
}

fn check_keywords(tokens: &[Token]) -> Result<(), SqlGuardError> {
    for tok in tokens {
        if tok.kind == TokenKind::Word && !tok.quoted {
            let lowered = tok.text.to_lowercase();
            if FORBIDDEN_KEYWORDS.contains(&lowered.as_str()) {
                // `replace(x, y, z)` the function is fine; `REPLACE INTO` is
                // not. A call is recognized by the `(` that follows.
                if lowered == "replace" && next_is_open_paren(tokens, tok) {
                    continue;
                }
                return Err(SqlGuardError::new(
                    SqlGuardErrorKind::ForbiddenKeyword,
                    format!("keyword `{}` is not allowed", lowered.to_uppercase()),
                ));
            }
        }
    }
    Ok(())
}

fn next_is_open_paren(tokens: &[Token], current: &Token) -> bool {
    tokens
        .iter()
        .find(|t| t.start >= current.end)
        .is_some_and(|t| t.kind == TokenKind::Punct && t.text == "(")
}

fn check_functions(tokens: &[Token]) -> Result<(), SqlGuardError> {
    for pair in tokens.windows(2) {
        let (word, paren) = (&pair[0], &pair[1]);
        if word.kind != TokenKind::Word
            || word.quoted
            || paren.kind != TokenKind::Punct
            || paren.text != "("
        {
            continue;
        }
        let lowered = word.text.to_lowercase();
        if PAREN_KEYWORDS.contains(&lowered.as_str()) {
            continue;
        }
        if lowered == "replace" {
            continue; // allowlisted; also screened by check_keywords
        }
        if !ALLOWED_FUNCTIONS.contains(&lowered.as_str()) {
            return Err(SqlGuardError::new(
                SqlGuardErrorKind::ForbiddenFunction,
                format!("function `{lowered}` is not on the allowlist"),
            ));
        }
    }
    Ok(())
}

/// Locates the top-level LIMIT of the (possibly compound) SELECT, clamps it
/// to `row_cap`, or appends one when absent.
fn apply_row_limit(
    sql: &str,
    tokens: &[Token],
    row_cap: usize,
) -> Result<ValidatedSql, SqlGuardError> {
    let mut warnings = Vec::new();
    let body_end = tokens.last().map_or(0, |t| t.end);
    let mut normalized = sql[..body_end].trim().to_string();

    let mut depth = 0i32;
    let mut limit_at = None;
    for (i, tok) in tokens.iter().enumerate() {
        match (tok.kind, tok.text.as_str()) {
            (TokenKind::Punct, "(") => depth += 1,
            (TokenKind::Punct, ")") => depth -= 1,
            (TokenKind::Word, _)
                if !tok.quoted && depth == 0 && tok.text.eq_ignore_ascii_case("limit") =>
            {
                limit_at = Some(i);
            }
            _ => {}
        }
    }

    let Some(limit_idx) = limit_at else {
        normalized = format!("{normalized} LIMIT {row_cap}");
        warnings.push(format!("no row limit; LIMIT {row_cap} injected"));
        return Ok(ValidatedSql {
            normalized_sql: normalized,
            warnings,
        });
    };

    // LIMIT n | LIMIT n OFFSET m | LIMIT m, n — the count is the token after
    // the comma when the comma form is used.
    let first = tokens.get(limit_idx + 1);
    let count_token = match (
        first,
        tokens.get(limit_idx + 2),
        tokens.get(limit_idx + 3),
    ) {
        (Some(_), Some(comma), Some(b))
            if comma.kind == TokenKind::Punct && comma.text == "," =>
        {
            Some(b)
        }
        (Some(a), _, _) => Some(a),
        _ => None,
    };
    let Some(count_token) = count_token.filter(|t| t.kind == TokenKind::Number) else {
        return Err(SqlGuardError::new(
            SqlGuardErrorKind::BadLimit,
            "LIMIT must use a literal row count",
        ));
    };
    let value: u64 = count_token.text.parse().map_err(|_| {
        SqlGuardError::new(
            SqlGuardErrorKind::BadLimit,
            format!("LIMIT value `{}` is not an integer", count_token.text),
        )
    })?;

    if value > row_cap as u64 {
        let offset_in_trimmed = {
            let leading = sql.len() - sql.trim_start().len();
            (count_token.start - leading, count_token.end - leading)
        };
        normalized.replace_range(
            offset_in_trimmed.0..offset_in_trimmed.1,
            &row_cap.to_string(),
        );
        warnings.push(format!("LIMIT {value} clamped to {row_cap}"));
    }

    Ok(ValidatedSql {
        normalized_sql: normalized,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(sql: &str) -> ValidatedSql {
        validate_sql(sql, 1000).unwrap_or_else(|e| panic!("expected valid, got {e}: {sql}"))
    }

    fn err_kind(sql: &str) -> SqlGuardErrorKind {
        validate_sql(sql, 1000).expect_err("expected rejection").kind
    }

    #[test]
    fn plain_select_gets_limit_injected() {
        let v = ok("SELECT id, status FROM users WHERE status = 'ACTIVE'");
        assert!(v.normalized_sql.ends_with("LIMIT 1000"));
        assert_eq!(v.warnings.len(), 1);
    }

    #[test]
    fn existing_limit_within_cap_is_untouched() {
        let v = ok("SELECT id FROM users LIMIT 5");
        assert_eq!(v.normalized_sql, "SELECT id FROM users LIMIT 5");
        assert!(v.warnings.is_empty());
    }

    #[test]
    fn oversized_limit_is_clamped_with_warning() {
        let v = ok("SELECT id FROM users LIMIT 999999");
        assert_eq!(v.normalized_sql, "SELECT id FROM users LIMIT 1000");
        assert_eq!(v.warnings.len(), 1);
    }

    #[test]
    fn limit_comma_form_clamps_the_count() {
        let v = ok("SELECT id FROM users LIMIT 10, 50000");
        assert!(v.normalized_sql.ends_with("LIMIT 10, 1000"));
    }

    #[test]
    fn subquery_limit_does_not_satisfy_the_top_level_requirement() {
        let v = ok("SELECT * FROM (SELECT id FROM users LIMIT 5)");
        assert!(v.normalized_sql.ends_with("LIMIT 1000"));
    }

    #[test]
    fn multiple_statements_rejected() {
        assert_eq!(
            err_kind("SELECT * FROM users; DROP TABLE users;"),
            SqlGuardErrorKind::MultipleStatements
        );
    }

    #[test]
    fn trailing_semicolon_is_tolerated() {
        let v = ok("SELECT id FROM users LIMIT 3;");
        assert_eq!(v.normalized_sql, "SELECT id FROM users LIMIT 3");
    }

    #[test]
    fn dml_and_ddl_rejected() {
        assert_eq!(err_kind("DELETE FROM users"), SqlGuardErrorKind::NotSelect);
        // No top-level SELECT behind the CTE: caught by the root check.
        assert_eq!(
            err_kind("WITH x AS (SELECT 1) DELETE FROM users"),
            SqlGuardErrorKind::NotSelect
        );
        // A top-level SELECT exists, but the INSERT still trips the keyword
        // screen.
        assert_eq!(
            err_kind("WITH x AS (SELECT 1) INSERT INTO users SELECT * FROM x"),
            SqlGuardErrorKind::ForbiddenKeyword
        );
        assert_eq!(err_kind("PRAGMA table_info(users)"), SqlGuardErrorKind::NotSelect);
        assert_eq!(
            err_kind("SELECT * FROM users WHERE id IN (SELECT id FROM users) UNION VACUUM"),
            SqlGuardErrorKind::ForbiddenKeyword
        );
    }

    #[test]
    fn comment_based_smuggling_rejected() {
        assert_eq!(
            err_kind("SELECT * FROM users -- LIMIT bypass\n"),
            SqlGuardErrorKind::CommentNotAllowed
        );
        assert_eq!(
            err_kind("SELECT /* sneak */ * FROM users"),
            SqlGuardErrorKind::CommentNotAllowed
        );
    }

    #[test]
    fn semicolon_inside_literal_is_data_not_a_separator() {
        let v = ok("SELECT id FROM users WHERE login = 'a;b' LIMIT 1");
        assert!(v.normalized_sql.contains("'a;b'"));
    }

    #[test]
    fn quoted_identifier_named_like_keyword_is_fine() {
        let v = ok(r#"SELECT "update" FROM users LIMIT 1"#);
        assert!(v.warnings.is_empty());
    }

    #[test]
    fn unbalanced_quote_rejected() {
        assert_eq!(
            err_kind("SELECT id FROM users WHERE login = 'abc"),
            SqlGuardErrorKind::UnbalancedQuote
        );
    }

    #[test]
    fn functions_off_the_allowlist_rejected() {
        assert_eq!(
            err_kind("SELECT load_extension('evil') FROM users"),
            SqlGuardErrorKind::ForbiddenFunction
        );
        assert_eq!(
            err_kind("SELECT readfile('/etc/passwd')"),
            SqlGuardErrorKind::ForbiddenFunction
        );
    }

    #[test]
    fn allowlisted_functions_and_cte_pass() {
        let v = ok(
            "WITH recent AS (SELECT id, date(created_at) AS d FROM users) \
             SELECT count(*) AS n FROM recent WHERE d >= date('now','-30 day') LIMIT 1",
        );
        assert!(v.warnings.is_empty());
    }

    #[test]
    fn replace_function_allowed_but_replace_statement_blocked() {
        assert!(validate_sql("SELECT replace(login, '@', ' at ') FROM users LIMIT 2", 10).is_ok());
        assert_eq!(
            err_kind("REPLACE INTO users VALUES (1)"),
            SqlGuardErrorKind::NotSelect
        );
    }

    #[test]
    fn non_literal_limit_rejected() {
        assert_eq!(err_kind("SELECT id FROM users LIMIT ?"), SqlGuardErrorKind::BadLimit);
    }

    #[test]
    fn empty_input_rejected() {
        assert_eq!(err_kind("   "), SqlGuardErrorKind::Empty);
    }
}
