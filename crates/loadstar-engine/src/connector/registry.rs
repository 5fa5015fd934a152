//! Connection lookup and endpoint construction.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use loadstar_types::error::ConnectorError;
use serde::Deserialize;

use crate::connector::file::FileEndpoint;
use crate::connector::memory::MemoryDatabase;
use crate::connector::{Endpoint, EndpointKind};
use crate::errors::TaskError;

/// A connection resolved to a concrete URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Name the connection was requested by (the URL itself for literals).
    pub name: String,
    pub url: String,
    pub scheme: String,
    pub kind: EndpointKind,
    pub params: BTreeMap<String, String>,
}

impl Connection {
    /// Parse a `scheme://...` URL. Returns `None` for anything else.
    #[must_use]
    pub fn from_url(name: impl Into<String>, url: &str) -> Option<Self> {
        let (scheme, _) = url.trim().split_once("://")?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return None;
        }
        let scheme = scheme.to_ascii_lowercase();
        Some(Self {
            name: name.into(),
            url: url.trim().to_string(),
            kind: EndpointKind::from_scheme(&scheme),
            scheme,
            params: BTreeMap::new(),
        })
    }

    /// Host part of the URL, without credentials or port.
    #[must_use]
    pub fn host(&self) -> &str {
        let rest = self.url.split_once("://").map_or("", |(_, rest)| rest);
        let authority = rest.split(['/', '?']).next().unwrap_or_default();
        let host = authority.rsplit('@').next().unwrap_or_default();
        host.split(':').next().unwrap_or_default()
    }

    /// URL reduced to its scheme, safe to persist.
    #[must_use]
    pub fn sanitized(&self) -> String {
        format!("{}://", self.scheme)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ConnectionEntry {
    Url(String),
    Detailed {
        url: String,
        #[serde(flatten)]
        params: BTreeMap<String, serde_yaml::Value>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct EnvFile {
    #[serde(default)]
    connections: BTreeMap<String, ConnectionEntry>,
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Turns connection names into [`Connection`]s.
///
/// Lookup order: a literal URL, a named entry from the env file, then an
/// environment variable named after the connection holding a URL.
#[derive(Clone)]
pub struct ConnectionResolver {
    entries: BTreeMap<String, Connection>,
    lookup: EnvLookup,
}

impl std::fmt::Debug for ConnectionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionResolver")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for ConnectionResolver {
    fn default() -> Self {
        Self::new(|key| std::env::var(key).ok())
    }
}

impl ConnectionResolver {
    #[must_use]
    pub fn new(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            entries: BTreeMap::new(),
            lookup: Arc::new(lookup),
        }
    }

    /// Resolver over the process environment plus the entries of `path`.
    /// A missing file contributes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let mut resolver = Self::default();
        if !path.exists() {
            return Ok(resolver);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read env file: {}", path.display()))?;
        resolver
            .add_entries_yaml(&text)
            .with_context(|| format!("Failed to parse env file: {}", path.display()))?;
        Ok(resolver)
    }

    /// Add the `connections:` entries of an env file document.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed YAML or an entry without a URL scheme.
    pub fn add_entries_yaml(&mut self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let file: EnvFile = serde_yaml::from_str(text)?;
        for (name, entry) in file.connections {
            let (url, params) = match entry {
                ConnectionEntry::Url(url) => (url, BTreeMap::new()),
                ConnectionEntry::Detailed { url, params } => (url, params),
            };
            let mut conn = Connection::from_url(name.clone(), &url)
                .with_context(|| format!("connection '{name}': '{url}' is not a URL"))?;
            conn.params = params
                .into_iter()
                .map(|(k, v)| {
                    let text = match v {
                        serde_yaml::Value::String(s) => s,
                        other => serde_yaml::to_string(&other)
                            .map(|s| s.trim_end().to_string())
                            .unwrap_or_default(),
                    };
                    (k, text)
                })
                .collect();
            self.insert(conn);
        }
        Ok(())
    }

    pub fn insert(&mut self, conn: Connection) {
        self.entries.insert(conn.name.to_lowercase(), conn);
    }

    /// Names of the configured entries.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|c| c.name.as_str())
    }

    /// Resolve `name` to a connection.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Connection`] when nothing matches.
    pub fn resolve(&self, name: &str) -> Result<Connection, TaskError> {
        self.resolve_in(name, &BTreeMap::new())
    }

    /// Resolve `name` with `env` layered over the env file and the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Connection`] when nothing matches.
    pub fn resolve_in(
        &self,
        name: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<Connection, TaskError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TaskError::Configuration("connection name is empty".into()));
        }
        if let Some(conn) = Connection::from_url(name, name) {
            return Ok(conn);
        }
        let overlay = env.get(name).or_else(|| env.get(&name.to_uppercase()));
        if let Some(url) = overlay {
            return Connection::from_url(name, url).ok_or_else(|| {
                TaskError::Connection(format!(
                    "connection '{name}': env value '{url}' is not a URL"
                ))
            });
        }
        if let Some(conn) = self.entries.get(&name.to_lowercase()) {
            return Ok(conn.clone());
        }
        let from_env = (self.lookup)(name).or_else(|| (self.lookup)(&name.to_uppercase()));
        if let Some(conn) = from_env.and_then(|url| Connection::from_url(name, &url)) {
            return Ok(conn);
        }
        Err(TaskError::Connection(format!(
            "could not find connection '{name}' (not a URL, env file entry or environment variable)"
        )))
    }
}

/// Builds an endpoint for a resolved connection.
pub type EndpointFactory =
    Arc<dyn Fn(&Connection) -> Result<Endpoint, ConnectorError> + Send + Sync>;

/// Scheme-keyed endpoint factories plus the connection resolver.
///
/// `file` and `memory` are registered out of the box. Every `memory://name`
/// connection made through the same registry sees the same database.
#[derive(Clone)]
pub struct ConnectorRegistry {
    resolver: ConnectionResolver,
    factories: BTreeMap<String, EndpointFactory>,
    memory: Arc<Mutex<BTreeMap<String, MemoryDatabase>>>,
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("resolver", &self.resolver)
            .field("schemes", &self.factories.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new(ConnectionResolver::default())
    }
}

impl ConnectorRegistry {
    #[must_use]
    pub fn new(resolver: ConnectionResolver) -> Self {
        let memory: Arc<Mutex<BTreeMap<String, MemoryDatabase>>> = Arc::default();
        let mut registry = Self {
            resolver,
            factories: BTreeMap::new(),
            memory: memory.clone(),
        };
        registry.register(
            "file",
            Arc::new(|conn: &Connection| -> Result<Endpoint, ConnectorError> {
                Ok(Endpoint::read_write(
                    EndpointKind::File,
                    Arc::new(FileEndpoint::from_url(&conn.url)),
                ))
            }),
        );
        registry.register(
            "memory",
            Arc::new(move |conn: &Connection| -> Result<Endpoint, ConnectorError> {
                let db = memory
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(conn.host().to_string())
                    .or_default()
                    .clone();
                Ok(Endpoint::read_write(EndpointKind::Database, Arc::new(db)))
            }),
        );
        registry
    }

    /// Register (or replace) the factory for a URL scheme.
    pub fn register(&mut self, scheme: &str, factory: EndpointFactory) {
        self.factories.insert(scheme.to_ascii_lowercase(), factory);
    }

    #[must_use]
    pub fn resolver(&self) -> &ConnectionResolver {
        &self.resolver
    }

    /// The shared database behind `memory://{name}`.
    #[must_use]
    pub fn memory_database(&self, name: &str) -> MemoryDatabase {
        self.memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Resolve a connection name and build its endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Connection`] for unknown names or schemes and
    /// for factories that fail.
    pub fn resolve(&self, name: &str) -> Result<(Connection, Endpoint), TaskError> {
        self.resolve_in(name, &BTreeMap::new())
    }

    /// [`resolve`](Self::resolve) with a task's `env` consulted first.
    ///
    /// # Errors
    ///
    /// Same as [`resolve`](Self::resolve).
    pub fn resolve_in(
        &self,
        name: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(Connection, Endpoint), TaskError> {
        let conn = self.resolver.resolve_in(name, env)?;
        let factory = self.factories.get(&conn.scheme).ok_or_else(|| {
            TaskError::Connection(format!(
                "connection '{}': no connector registered for scheme '{}'",
                conn.name, conn.scheme
            ))
        })?;
        let endpoint = factory(&conn).map_err(|e| {
            TaskError::Connection(format!("connection '{}': {e}", conn.name))
        })?;
        Ok((conn, endpoint))
    }
}
