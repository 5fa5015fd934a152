//! Content digests and stream identity.
//!
//! Digests are SHA-256 over a canonical JSON rendering: object keys sorted
//! at every depth, no insignificant whitespace. Two configurations that
//! parse to the same typed value therefore share a digest regardless of
//! key order or formatting in the text they came from.

use loadstar_types::state::{ContentDigest, StreamId};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::types::{ReplicationManifest, TaskConfig};
use crate::settings::BOOKKEEPING_ENV_KEYS;

/// Hex-encoded SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Canonical JSON text of any serializable value.
///
/// # Errors
///
/// Returns an error if `value` cannot be represented as JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let tree = canonicalize(serde_json::to_value(value)?);
    serde_json::to_string(&tree)
}

/// Digest of the canonical JSON of `value`.
///
/// # Errors
///
/// Returns an error if `value` cannot be represented as JSON.
pub fn content_digest<T: Serialize>(value: &T) -> serde_json::Result<ContentDigest> {
    Ok(ContentDigest::new(sha256_hex(canonical_json(value)?.as_bytes())))
}

/// Digest of a task configuration, ignoring bookkeeping env entries.
///
/// # Errors
///
/// Returns an error if the configuration cannot be represented as JSON.
pub fn task_digest(config: &TaskConfig) -> serde_json::Result<ContentDigest> {
    let mut semantic = config.clone();
    semantic
        .env
        .retain(|k, _| !BOOKKEEPING_ENV_KEYS.contains(&k.as_str()));
    content_digest(&semantic)
}

/// Digest of a manifest as declared, before wildcard expansion.
///
/// # Errors
///
/// Returns an error if the manifest cannot be represented as JSON.
pub fn manifest_digest(manifest: &ReplicationManifest) -> serde_json::Result<ContentDigest> {
    content_digest(manifest)
}

/// Stable identity of a (source connection, target connection, stream) triple.
#[must_use]
pub fn stream_id(source_conn: &str, target_conn: &str, stream: &str) -> StreamId {
    let key = format!(
        "{}\u{1f}{}\u{1f}{}",
        source_conn.trim(),
        target_conn.trim(),
        stream.trim()
    );
    StreamId::new(sha256_hex(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::{parse_payload, parse_task_str};
    use crate::config::types::SourceOptions;
    use serde_json::json;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"z": 1, "a": [ {"y": 2, "x": 1} ]}, "a": null});
        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"a":null,"b":{"a":[{"x":1,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn field_order_and_whitespace_do_not_change_digest() {
        let a = parse_task_str(
            "source: {conn: s, stream: users, options: {limit: 5, fetch: 100}}\n\
             target: {conn: t, object: users}\nmode: append\n",
        )
        .unwrap();
        let b = parse_task_str(
            "mode:   append\ntarget:\n  object: users\n  conn: t\n\
             source:\n  options:\n    fetch: 100\n    limit: 5\n  stream: users\n  conn: s\n",
        )
        .unwrap();
        assert_eq!(task_digest(&a).unwrap(), task_digest(&b).unwrap());
    }

    #[test]
    fn inline_payload_formats_share_digest() {
        let mut a = parse_task_str("source: {conn: s, stream: x}\ntarget: {conn: t, object: y}")
            .unwrap();
        let mut b = a.clone();
        a.source.options = serde_json::from_value(json!(
            parse_payload(r#"{ "limit" : 3,"strict_incremental":true }"#).unwrap()
        ))
        .unwrap();
        b.source.options = serde_json::from_value::<SourceOptions>(json!(
            parse_payload("strict_incremental: true\nlimit:    3").unwrap()
        ))
        .unwrap();
        assert_eq!(task_digest(&a).unwrap(), task_digest(&b).unwrap());
    }

    #[test]
    fn semantic_change_changes_digest() {
        let a = parse_task_str("source: {conn: s, stream: x}\ntarget: {conn: t, object: y}")
            .unwrap();
        let mut b = a.clone();
        b.target.object = "z".into();
        assert_ne!(task_digest(&a).unwrap(), task_digest(&b).unwrap());
    }

    #[test]
    fn bookkeeping_env_is_ignored() {
        let a = parse_task_str("source: {conn: s, stream: x}\ntarget: {conn: t, object: y}")
            .unwrap();
        let mut b = a.clone();
        b.env
            .insert("LOADSTAR_CONFIG_PATH".into(), "/tmp/x.yaml".into());
        assert_eq!(task_digest(&a).unwrap(), task_digest(&b).unwrap());
        b.env.insert("THREADS".into(), "4".into());
        assert_ne!(task_digest(&a).unwrap(), task_digest(&b).unwrap());
    }

    #[test]
    fn stream_id_is_stable_and_separated() {
        let a = stream_id("pg", "file", "public.users");
        assert_eq!(a, stream_id("pg", "file", "public.users"));
        assert_ne!(stream_id("ab", "c", "d"), stream_id("a", "bc", "d"));
    }
}
