//! Line-oriented WAL record format.
//!
//! One record per line, space separated. The first token is the bare operation
//! name, every other token is a double-quoted ASCII string. Transaction ids and
//! versions are quoted lowercase hexadecimal.
//!
//! ```text
//! put "key" "value" "tx" ["version"]   version present iff tx == 0
//! del "key" "tx" ["version"]           version present iff tx == 0
//! start "tx"
//! commit "tx" "version"
//! rollback "tx"
//! version "version"                    version counter at the head of a checkpointed log
//! ```

use crate::txn::{TxnId, TRANSACTION_COUNT};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unknown operation: {0:?}")]
    UnknownOp(String),

    #[error("{op}: expected {expected} tokens, found {found}")]
    Arity {
        op: &'static str,
        expected: &'static str,
        found: usize,
    },

    #[error("{0}: main timeline record without version")]
    MissingVersion(&'static str),

    #[error("{0}: transactional record carries a version")]
    UnexpectedVersion(&'static str),

    #[error("unterminated quoted token")]
    Unterminated,

    #[error("token is not quoted: {0:?}")]
    Unquoted(String),

    #[error("invalid escape sequence in {0:?}")]
    BadEscape(String),

    #[error("invalid hex number: {0:?}")]
    BadNumber(String),

    #[error("transaction id {0} out of range")]
    TxnOutOfRange(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Put {
        key: String,
        value: String,
        txn: TxnId,
        version: Option<u64>,
    },
    Del {
        key: String,
        txn: TxnId,
        version: Option<u64>,
    },
    Start {
        txn: TxnId,
    },
    Commit {
        txn: TxnId,
        version: u64,
    },
    Rollback {
        txn: TxnId,
    },
    /// Carries the version counter across a checkpoint, whose fresh log has
    /// no versioned writes of its own.
    Version {
        version: u64,
    },
}

impl LogRecord {
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Put { .. } => "put",
            Self::Del { .. } => "del",
            Self::Start { .. } => "start",
            Self::Commit { .. } => "commit",
            Self::Rollback { .. } => "rollback",
            Self::Version { .. } => "version",
        }
    }

    pub fn txn(&self) -> TxnId {
        match self {
            Self::Put { txn, .. }
            | Self::Del { txn, .. }
            | Self::Start { txn }
            | Self::Commit { txn, .. }
            | Self::Rollback { txn } => *txn,
            Self::Version { .. } => TxnId::MAIN,
        }
    }

    /// Encodes the record as a single newline-terminated line.
    pub fn encode(&self) -> String {
        let mut line = String::from(self.op_name());
        let mut push = |token: &str| {
            line.push(' ');
            quote_into(token, &mut line);
        };
        match self {
            Self::Put {
                key,
                value,
                txn,
                version,
            } => {
                push(key);
                push(value);
                push(&hex(txn.0 as u64));
                if let Some(version) = version {
                    push(&hex(*version));
                }
            }
            Self::Del { key, txn, version } => {
                push(key);
                push(&hex(txn.0 as u64));
                if let Some(version) = version {
                    push(&hex(*version));
                }
            }
            Self::Start { txn } | Self::Rollback { txn } => push(&hex(txn.0 as u64)),
            Self::Commit { txn, version } => {
                push(&hex(txn.0 as u64));
                push(&hex(*version));
            }
            Self::Version { version } => push(&hex(*version)),
        }
        line.push('\n');
        line
    }

    /// Decodes one line. Returns `Ok(None)` for blank lines.
    pub fn decode(line: &str) -> Result<Option<Self>, CodecError> {
        let tokens = tokenize(line)?;
        let Some((op, args)) = tokens.split_first() else {
            return Ok(None);
        };

        let record = match op.as_str() {
            "put" => {
                // key value tx [version]
                if !(3..=4).contains(&args.len()) {
                    return Err(arity("put", "3 or 4", args.len()));
                }
                let txn = parse_txn(&args[2])?;
                let version = parse_version("put", txn, args.get(3))?;
                Self::Put {
                    key: unquote(&args[0])?,
                    value: unquote(&args[1])?,
                    txn,
                    version,
                }
            }
            "del" => {
                if !(2..=3).contains(&args.len()) {
                    return Err(arity("del", "2 or 3", args.len()));
                }
                let txn = parse_txn(&args[1])?;
                let version = parse_version("del", txn, args.get(2))?;
                Self::Del {
                    key: unquote(&args[0])?,
                    txn,
                    version,
                }
            }
            "start" => {
                if args.len() != 1 {
                    return Err(arity("start", "1", args.len()));
                }
                Self::Start {
                    txn: parse_txn(&args[0])?,
                }
            }
            "commit" => {
                if args.len() != 2 {
                    return Err(arity("commit", "2", args.len()));
                }
                Self::Commit {
                    txn: parse_txn(&args[0])?,
                    version: parse_hex(&args[1])?,
                }
            }
            "rollback" => {
                if args.len() != 1 {
                    return Err(arity("rollback", "1", args.len()));
                }
                Self::Rollback {
                    txn: parse_txn(&args[0])?,
                }
            }
            "version" => {
                if args.len() != 1 {
                    return Err(arity("version", "1", args.len()));
                }
                Self::Version {
                    version: parse_hex(&args[0])?,
                }
            }
            other => return Err(CodecError::UnknownOp(other.to_string())),
        };
        Ok(Some(record))
    }
}

fn arity(op: &'static str, expected: &'static str, found: usize) -> CodecError {
    CodecError::Arity {
        op,
        expected,
        found,
    }
}

/// Writes on the main timeline carry a version; transactional ones never do.
fn parse_version(
    op: &'static str,
    txn: TxnId,
    token: Option<&String>,
) -> Result<Option<u64>, CodecError> {
    match (txn.is_main(), token) {
        (true, Some(token)) => Ok(Some(parse_hex(token)?)),
        (false, None) => Ok(None),
        (true, None) => Err(CodecError::MissingVersion(op)),
        (false, Some(_)) => Err(CodecError::UnexpectedVersion(op)),
    }
}

fn parse_txn(token: &str) -> Result<TxnId, CodecError> {
    let raw = parse_hex(token)?;
    if raw >= TRANSACTION_COUNT as u64 {
        return Err(CodecError::TxnOutOfRange(raw));
    }
    Ok(TxnId(raw as u32))
}

fn parse_hex(token: &str) -> Result<u64, CodecError> {
    let digits = unquote(token)?;
    u64::from_str_radix(&digits, 16).map_err(|_| CodecError::BadNumber(digits))
}

fn hex(value: u64) -> String {
    format!("{value:x}")
}

/// Splits a line into raw tokens. Quoted tokens keep their quotes and may
/// contain spaces; the closing quote is the first unescaped `"`.
fn tokenize(line: &str) -> Result<Vec<String>, CodecError> {
    let mut tokens = Vec::new();
    let mut chars = line.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut escaped = false;
            let mut end = None;
            for (idx, c) in chars.by_ref() {
                match (escaped, c) {
                    (true, _) => escaped = false,
                    (false, '\\') => escaped = true,
                    (false, '"') => {
                        end = Some(idx + 1);
                        break;
                    }
                    _ => {}
                }
            }
            let end = end.ok_or(CodecError::Unterminated)?;
            tokens.push(line[start..end].to_string());
        } else {
            let mut end = line.len();
            while let Some(&(idx, c)) = chars.peek() {
                if c.is_whitespace() {
                    end = idx;
                    break;
                }
                chars.next();
            }
            tokens.push(line[start..end].to_string());
        }
    }
    Ok(tokens)
}

/// Quotes `s` as a double-quoted, ASCII-only literal.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    quote_into(s, &mut out);
    out
}

fn quote_into(s: &str, out: &mut String) {
    use std::fmt::Write;

    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\x07' => out.push_str("\\a"),
            '\x08' => out.push_str("\\b"),
            '\x0c' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0b' => out.push_str("\\v"),
            ' '..='~' => out.push(c),
            c if (c as u32) < 0x80 => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c if (c as u32) <= 0xffff => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => {
                let _ = write!(out, "\\U{:08x}", c as u32);
            }
        }
    }
    out.push('"');
}

/// Reverses [`quote`]. Also accepts three-digit octal escapes.
pub fn unquote(token: &str) -> Result<String, CodecError> {
    let inner = token
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| CodecError::Unquoted(token.to_string()))?;

    let bad = || CodecError::BadEscape(token.to_string());
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '"' {
            return Err(bad());
        }
        if c != '\\' {
            out.push(c);
            continue;
        }
        let esc = chars.next().ok_or_else(bad)?;
        let decoded = match esc {
            'a' => '\x07',
            'b' => '\x08',
            'f' => '\x0c',
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            'v' => '\x0b',
            '\\' => '\\',
            '"' => '"',
            '\'' => '\'',
            'x' | 'u' | 'U' => {
                let width = match esc {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let digits: String = chars.by_ref().take(width).collect();
                if digits.len() != width {
                    return Err(bad());
                }
                let code = u32::from_str_radix(&digits, 16).map_err(|_| bad())?;
                char::from_u32(code).ok_or_else(bad)?
            }
            '0'..='7' => {
                let rest: String = chars.by_ref().take(2).collect();
                let digits = format!("{esc}{rest}");
                if digits.len() != 3 {
                    return Err(bad());
                }
                let code = u32::from_str_radix(&digits, 8).map_err(|_| bad())?;
                if code > 0xff {
                    return Err(bad());
                }
                char::from_u32(code).ok_or_else(bad)?
            }
            _ => return Err(bad()),
        };
        out.push(decoded);
    }
    Ok(out)
}
