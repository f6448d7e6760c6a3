//! Minimal SQL lexer for the safety guard.
//!
//! Produces word / number / punctuation tokens with byte spans into the
//! original string. String literals collapse into `Literal` tokens; quoted
//! identifiers become `Word` tokens flagged `quoted`. Comments and
//! unterminated quotes are hard errors here so the checks above never see
//! them.

use super::{SqlGuardError, SqlGuardErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum TokenKind {
    Word,
    Number,
    Literal,
    Punct,
}

#[derive(Clone, Debug)]
pub(super) struct Token {
    pub kind: TokenKind,
    /// Token text; for literals the quotes are included.
    pub text: String,
    /// True for identifiers that were double-quoted, backticked or
    /// bracketed; keyword checks do not apply to them.
    pub quoted: bool,
    pub start: usize,
    pub end: usize,
}

pub(super) fn tokenize(sql: &str) -> Result<Vec<Token>, SqlGuardError> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // Comments: rejected outright, not skipped.
        if c == '-' && bytes.get(i + 1) == Some(&b'-') {
            return Err(SqlGuardError {
                kind: SqlGuardErrorKind::CommentNotAllowed,
                reason: "line comments are not allowed".into(),
            });
        }
        if c == '/' && bytes.get(i + 1) == Some(&b'*') {
            return Err(SqlGuardError {
                kind: SqlGuardErrorKind::CommentNotAllowed,
                reason: "block comments are not allowed".into(),
            });
        }

        // String literal: '...' with '' escaping.
        if c == '\'' {
            let end = scan_quoted(bytes, i, b'\'').ok_or_else(|| SqlGuardError {
                kind: SqlGuardErrorKind::UnbalancedQuote,
                reason: "unterminated string literal".into(),
            })?;
            tokens.push(Token {
                kind: TokenKind::Literal,
                text: sql[i..end].to_string(),
                quoted: false,
                start: i,
                end,
            });
            i = end;
            continue;
        }

        // Quoted identifiers: "..." (with "" escaping), `...`, [...].
        if c == '"' || c == '`' || c == '[' {
            let close = if c == '[' { b']' } else { bytes[i] };
            let end = if c == '[' {
                scan_until(bytes, i + 1, close)
            } else {
                scan_quoted(bytes, i, close)
            }
            .ok_or_else(|| SqlGuardError {
                kind: SqlGuardErrorKind::UnbalancedQuote,
                reason: "unterminated quoted identifier".into(),
            })?;
            tokens.push(Token {
                kind: TokenKind::Word,
                text: sql[i + 1..end - 1].to_string(),
                quoted: true,
                start: i,
                end,
            });
            i = end;
            continue;
        }

        if c.is_ascii_digit() {
            let mut end = i + 1;
            while end < bytes.len()
                && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'.' || bytes[end] == b'_')
            {
                end += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Number,
                text: sql[i..end].to_string(),
                quoted: false,
                start: i,
                end,
            });
            i = end;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let mut end = i + 1;
            while end < bytes.len()
                && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_' || bytes[end] == b'$')
            {
                end += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Word,
                text: sql[i..end].to_string(),
                quoted: false,
                start: i,
                end,
            });
            i = end;
            continue;
        }

        // Everything else is single-char punctuation; multi-char operators
        // lex as adjacent tokens, which is enough for the checks above.
        tokens.push(Token {
            kind: TokenKind::Punct,
            text: c.to_string(),
            quoted: false,
            start: i,
            end: i + 1,
        });
        i += 1;
    }

    Ok(tokens)
}

/// Scans a quoted region starting at the opening quote; the closing quote
/// may be escaped by doubling. Returns the byte index just past the close.
fn scan_quoted(bytes: &[u8], start: usize, quote: u8) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

/// Scans to a closing byte with no escaping (bracket identifiers).
fn scan_until(bytes: &[u8], start: usize, close: u8) -> Option<usize> {
    bytes[start..]
        .iter()
        .position(|&b| b == close)
        .map(|p| start + p + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_numbers_and_punct_have_spans() {
        let toks = tokenize("SELECT id FROM users LIMIT 10").unwrap();
        let texts: Vec<_> = toks.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["SELECT", "id", "FROM", "users", "LIMIT", "10"]);
        assert_eq!(toks[5].kind, TokenKind::Number);
        assert_eq!(&"SELECT id FROM users LIMIT 10"[toks[5].start..toks[5].end], "10");
    }

    #[test]
    fn literal_with_escaped_quote() {
        let toks = tokenize("SELECT 'it''s; fine'").unwrap();
        assert_eq!(toks.len(), 2);
        assert_eq!(toks[1].kind, TokenKind::Literal);
        assert_eq!(toks[1].text, "'it''s; fine'");
    }

    #[test]
    fn double_quoted_identifier_is_flagged() {
        let toks = tokenize(r#"SELECT "weird name" FROM t"#).unwrap();
        assert!(toks[1].quoted);
        assert_eq!(toks[1].text, "weird name");
    }

    #[test]
    fn comments_error_out() {
        assert!(tokenize("SELECT 1 -- hi").is_err());
        assert!(tokenize("SELECT /* hi */ 1").is_err());
    }

    #[test]
    fn unterminated_literal_errors_out() {
        let err = tokenize("SELECT 'oops").unwrap_err();
        assert_eq!(err.kind, SqlGuardErrorKind::UnbalancedQuote);
    }
}
