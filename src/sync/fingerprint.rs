//! Response fingerprinting and the conditional cache gate
//!
//! The fingerprint is a SHA-256 digest over a canonical encoding of the
//! change-set: snapshot fields in declaration order, object keys sorted,
//! instants in fixed-width UTC form. Two requests that would return the same
//! records therefore always carry the same `ETag`.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::timestamp::format_instant;
use super::types::{CacheToken, RecordSnapshot};

/// Digest a change-set
pub fn fingerprint(change_set: &[RecordSnapshot]) -> CacheToken {
    let mut hasher = Sha256::new();
    let mut buf = Vec::with_capacity(256);

    buf.push(b'[');
    for (i, snapshot) in change_set.iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        write_snapshot(snapshot, &mut buf);
        // Flush per record to keep the buffer small on large change-sets
        hasher.update(&buf);
        buf.clear();
    }
    buf.push(b']');
    hasher.update(&buf);

    CacheToken::from_digest(hex::encode(hasher.finalize()))
}

/// Decide between a full payload and "not modified".
///
/// `presented` is the raw `If-None-Match` header value. Absent, empty or
/// unparseable values never match.
pub fn should_serve_full(presented: Option<&str>, fresh: &CacheToken) -> bool {
    match presented {
        Some(raw) => !entity_tag_matches(raw, fresh),
        None => true,
    }
}

fn entity_tag_matches(raw: &str, fresh: &CacheToken) -> bool {
    raw.split(',').any(|candidate| {
        let candidate = candidate.trim();
        if candidate == "*" {
            return true;
        }
        match opaque_tag(candidate) {
            Some(tag) => tag == fresh.as_str(),
            None => false,
        }
    })
}

/// Strip the weak prefix and quotes from one entity tag
fn opaque_tag(candidate: &str) -> Option<&str> {
    let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
    let unquoted = match candidate.strip_prefix('"') {
        Some(rest) => rest.strip_suffix('"')?,
        // Tolerate clients that echo the bare digest
        None => candidate,
    };
    if unquoted.is_empty() || unquoted.contains('"') {
        return None;
    }
    Some(unquoted)
}

fn write_snapshot(snapshot: &RecordSnapshot, out: &mut Vec<u8>) {
    out.extend_from_slice(b"{\"id\":");
    write_string(&snapshot.id, out);
    out.extend_from_slice(b",\"createdAt\":");
    write_string(&format_instant(snapshot.created_at), out);
    out.extend_from_slice(b",\"modifiedAt\":");
    write_string(&format_instant(snapshot.modified_at), out);
    out.extend_from_slice(b",\"payload\":");
    write_canonical(&snapshot.payload, out);
    out.push(b'}');
}

/// JSON with object keys in sorted order, regardless of map implementation
fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                write_canonical(&map[key], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_string(s, out),
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    // Serializing a &str into a Vec cannot fail
    if serde_json::to_writer(&mut *out, s).is_err() {
        out.extend_from_slice(s.as_bytes());
    }
}
