//! Deterministic request identity.
//!
//! A `QueryFingerprint` is a SHA-256 digest over the normalized query text,
//! the canonical encoding of the variable bindings, and the caller's
//! role/tenant context. Whitespace, comments, insignificant commas, and the
//! key order of variable objects do not affect the digest.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Role and tenant the request executes under.
///
/// Part of the fingerprint so that results visible to one role or tenant are
/// never served to another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestContext {
    pub role: Option<String>,
    pub tenant: Option<String>,
}

impl RequestContext {
    pub fn new(role: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            tenant: Some(tenant.into()),
        }
    }
}

/// 32-byte digest identifying a `(query, variables, context)` tuple.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryFingerprint([u8; 32]);

impl QueryFingerprint {
    /// Fingerprint a request.
    pub fn compute(query: &str, variables: &Value, context: &RequestContext) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"q\0");
        hasher.update(normalize_query(query).as_bytes());
        hasher.update(b"\0v\0");
        hasher.update(canonical_json(variables).as_bytes());
        hasher.update(b"\0r\0");
        hasher.update(context.role.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\0t\0");
        hasher.update(context.tenant.as_deref().unwrap_or("").as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Abbreviated hex form for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    /// Stable bucket in `0..buckets`, used to pick a cache shard.
    pub fn bucket(&self, buckets: usize) -> usize {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        (u64::from_le_bytes(head) % buckets.max(1) as u64) as usize
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryFingerprint({})", self.short())
    }
}

/// Collapse a GraphQL document to a canonical single-line form.
///
/// Comments are dropped, commas are treated as whitespace, whitespace runs
/// become a single space, and whitespace next to punctuation is removed.
/// String literals, block strings included, are copied verbatim.
pub fn normalize_query(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match c {
            '#' => {
                // Comment runs to end of line.
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
                pending_space = true;
            }
            '"' if quotes_ahead(&chars, 2) => {
                flush_space(&mut out, &mut pending_space, c);
                out.push_str(TRIPLE_QUOTE);
                chars.nth(1);
                copy_block_string(&mut chars, &mut out);
            }
            '"' => {
                flush_space(&mut out, &mut pending_space, c);
                out.push(c);
                let mut escaped = false;
                for next in chars.by_ref() {
                    out.push(next);
                    if escaped {
                        escaped = false;
                    } else if next == '\\' {
                        escaped = true;
                    } else if next == '"' {
                        break;
                    }
                }
            }
            c if c.is_whitespace() || c == ',' => pending_space = true,
            c => {
                flush_space(&mut out, &mut pending_space, c);
                out.push(c);
            }
        }
    }
    out
}

const TRIPLE_QUOTE: &str = "\"\"\"";

/// Whether the next `n` characters are all `"`.
fn quotes_ahead(chars: &Peekable<Chars<'_>>, n: usize) -> bool {
    chars.clone().take(n).filter(|c| *c == '"').count() == n
}

/// Copy a block string body and its closing `"""`. Inside, only `\"""`
/// is an escape.
fn copy_block_string(chars: &mut Peekable<Chars<'_>>, out: &mut String) {
    while let Some(c) = chars.next() {
        match c {
            '\\' if quotes_ahead(chars, 3) => {
                out.push('\\');
                out.push_str(TRIPLE_QUOTE);
                chars.nth(2);
            }
            '"' if quotes_ahead(chars, 2) => {
                out.push_str(TRIPLE_QUOTE);
                chars.nth(1);
                return;
            }
            c => out.push(c),
        }
    }
}

fn flush_space(out: &mut String, pending: &mut bool, next: char) {
    if *pending {
        let prev_is_punct = out.chars().last().is_some_and(is_punctuator);
        if !out.is_empty() && !prev_is_punct && !is_punctuator(next) {
            out.push(' ');
        }
        *pending = false;
    }
}

fn is_punctuator(c: char) -> bool {
    matches!(
        c,
        '{' | '}' | '(' | ')' | '[' | ']' | ':' | '=' | '!' | '@' | '$' | '|' | '&'
    )
}

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
