//! Strongly typed task and replication configuration.
//!
//! Every optional field is an explicit `Option` so that [`Merge`] can
//! combine layers field by field: caller overrides over per-stream
//! overrides over manifest defaults.

use std::collections::BTreeMap;
use std::fmt;

use loadstar_types::mode::Mode;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// Free-form connector options passed through untouched.
pub type OptionMap = BTreeMap<String, serde_json::Value>;

/// Field-by-field combination of two configuration layers.
pub trait Merge {
    /// Combine `self` with `fallback`; fields set on `self` win.
    #[must_use]
    fn merge(self, fallback: Self) -> Self;
}

fn merge_nested<T: Merge>(preferred: Option<T>, fallback: Option<T>) -> Option<T> {
    match (preferred, fallback) {
        (Some(p), Some(f)) => Some(p.merge(f)),
        (p, f) => p.or(f),
    }
}

fn merge_extra(preferred: OptionMap, mut fallback: OptionMap) -> OptionMap {
    fallback.extend(preferred);
    fallback
}

/// Case-normalized form used for stream matching.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.trim().replace('"', "").to_lowercase()
}

// ---------------------------------------------------------------------------
// Key lists: `primary_key: id` or `primary_key: [a, b]`
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum KeyList {
    One(String),
    Many(Vec<String>),
}

impl From<KeyList> for Vec<String> {
    fn from(keys: KeyList) -> Self {
        match keys {
            KeyList::One(key) => key
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect(),
            KeyList::Many(keys) => keys,
        }
    }
}

fn key_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(KeyList::deserialize(deserializer)?.into())
}

fn opt_key_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error> {
    Ok(Option::<KeyList>::deserialize(deserializer)?.map(Into::into))
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Source-side options. Unknown keys are kept for the connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceOptions {
    /// Row limit for non-incremental reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Use `>` instead of `>=` for the incremental predicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict_incremental: Option<bool>,
    #[serde(flatten)]
    pub extra: OptionMap,
}

impl SourceOptions {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Merge for SourceOptions {
    fn merge(self, fallback: Self) -> Self {
        Self {
            limit: self.limit.or(fallback.limit),
            strict_incremental: self.strict_incremental.or(fallback.strict_incremental),
            extra: merge_extra(self.extra, fallback.extra),
        }
    }
}

/// Target-side options. Unknown keys are kept for the connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetOptions {
    /// Statement executed on the target before loading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_sql: Option<String>,
    /// Statement executed on the target after commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_sql: Option<String>,
    #[serde(flatten)]
    pub extra: OptionMap,
}

impl TargetOptions {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Merge for TargetOptions {
    fn merge(self, fallback: Self) -> Self {
        Self {
            pre_sql: self.pre_sql.or(fallback.pre_sql),
            post_sql: self.post_sql.or(fallback.post_sql),
            extra: merge_extra(self.extra, fallback.extra),
        }
    }
}

// ---------------------------------------------------------------------------
// Task configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Connection name or URL.
    pub conn: String,
    /// Object to read (table name, file path, endpoint).
    #[serde(default)]
    pub stream: String,
    #[serde(default, alias = "select", skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(
        default,
        deserialize_with = "key_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub primary_key: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_key: Option<String>,
    /// Explicit query, with optional incremental placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "SourceOptions::is_empty")]
    pub options: SourceOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Connection name or URL.
    pub conn: String,
    #[serde(default)]
    pub object: String,
    #[serde(default, skip_serializing_if = "TargetOptions::is_empty")]
    pub options: TargetOptions,
}

/// One source-to-target transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub source: SourceConfig,
    pub target: TargetConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    /// Fixed incremental value, overriding the target and stored checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_value: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl TaskConfig {
    /// Mode with the default applied.
    #[must_use]
    pub fn effective_mode(&self) -> Mode {
        self.mode.unwrap_or_default()
    }

    /// Name used for stream identity and reporting.
    #[must_use]
    pub fn stream_name(&self) -> &str {
        if self.source.stream.is_empty() {
            self.source.sql.as_deref().unwrap_or_default()
        } else {
            &self.source.stream
        }
    }

    /// Apply a caller override on top of this configuration.
    #[must_use]
    pub fn with_override(mut self, over: StreamOverride) -> Self {
        if let Some(object) = over.object {
            self.target.object = object;
        }
        self.mode = over.mode.or(self.mode);
        if let Some(columns) = over.columns {
            self.source.columns = columns;
        }
        if let Some(pk) = over.primary_key {
            self.source.primary_key = pk;
        }
        self.source.update_key = over.update_key.or(self.source.update_key);
        self.source.sql = over.sql.or(self.source.sql);
        if let Some(options) = over.source_options {
            self.source.options = options.merge(self.source.options);
        }
        if let Some(options) = over.target_options {
            self.target.options = options.merge(self.target.options);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Replication manifest
// ---------------------------------------------------------------------------

/// Per-stream settings; also used for manifest defaults and caller overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, alias = "select", skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(
        default,
        deserialize_with = "opt_key_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub primary_key: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    /// Streams that must run before this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_options: Option<SourceOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_options: Option<TargetOptions>,
}

impl StreamOverride {
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.unwrap_or(false)
    }
}

impl Merge for StreamOverride {
    fn merge(self, fallback: Self) -> Self {
        Self {
            object: self.object.or(fallback.object),
            mode: self.mode.or(fallback.mode),
            columns: self.columns.or(fallback.columns),
            primary_key: self.primary_key.or(fallback.primary_key),
            update_key: self.update_key.or(fallback.update_key),
            sql: self.sql.or(fallback.sql),
            disabled: self.disabled.or(fallback.disabled),
            depends_on: self.depends_on.or(fallback.depends_on),
            source_options: merge_nested(self.source_options, fallback.source_options),
            target_options: merge_nested(self.target_options, fallback.target_options),
        }
    }
}

/// A stream as declared in a manifest, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredStream {
    pub name: String,
    pub config: StreamOverride,
}

impl DeclaredStream {
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.name.contains('*')
    }
}

/// Ordered `name -> override` mapping. YAML mappings keep their order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamList(pub Vec<DeclaredStream>);

impl StreamList {
    pub fn iter(&self) -> impl Iterator<Item = &DeclaredStream> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for StreamList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for stream in &self.0 {
            map.serialize_entry(&stream.name, &stream.config)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StreamList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StreamListVisitor;

        impl<'de> Visitor<'de> for StreamListVisitor {
            type Value = StreamList;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of stream name to stream settings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<StreamList, A::Error> {
                let mut streams: Vec<DeclaredStream> = Vec::new();
                while let Some((name, config)) =
                    access.next_entry::<String, Option<StreamOverride>>()?
                {
                    if streams.iter().any(|s| s.name == name) {
                        return Err(de::Error::custom(format!("duplicate stream '{name}'")));
                    }
                    streams.push(DeclaredStream {
                        name,
                        config: config.unwrap_or_default(),
                    });
                }
                Ok(StreamList(streams))
            }
        }

        deserializer.deserialize_map(StreamListVisitor)
    }
}

/// A named source, a named target and the streams to move between them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationManifest {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub defaults: StreamOverride,
    #[serde(default)]
    pub streams: StreamList,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}
