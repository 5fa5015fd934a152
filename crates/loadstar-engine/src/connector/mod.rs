//! Capability interfaces between the engine and source/target endpoints.
//!
//! The task controller is written once against [`SourceConnector`] and
//! [`TargetConnector`]. Both are synchronous: the controller runs them on
//! blocking threads and connects them with a bounded row channel.

use std::sync::Arc;

use loadstar_types::error::ConnectorError;
use loadstar_types::mode::WriteMode;

use crate::cleanup::CleanupHandle;
use crate::config::types::OptionMap;

pub mod channel;
pub mod file;
pub mod memory;
pub mod registry;

pub use crate::checkpoint::ReadSpec;
pub use channel::{row_channel, NoProgress, ProgressSink, RowReceiver, RowSender};
pub use registry::{Connection, ConnectionResolver, ConnectorRegistry, EndpointFactory};

/// Broad family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Database,
    File,
    Api,
}

impl EndpointKind {
    /// Family implied by a URL scheme.
    #[must_use]
    pub fn from_scheme(scheme: &str) -> Self {
        match scheme {
            "file" | "s3" | "gs" | "azure" | "sftp" | "ftp" => Self::File,
            "http" | "https" => Self::Api,
            _ => Self::Database,
        }
    }
}

/// What a target is asked to load.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub object: String,
    pub mode: WriteMode,
    pub options: OptionMap,
    /// Register removal of staged objects here.
    pub cleanup: CleanupHandle,
}

/// Outcome of a committed load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows_written: u64,
    pub bytes_written: u64,
}

/// An endpoint rows can be read from.
pub trait SourceConnector: Send + Sync {
    /// Object names matching a `*` pattern, in a stable order.
    ///
    /// # Errors
    ///
    /// Returns a connector error when the catalog cannot be listed.
    fn discover(&self, pattern: &str) -> Result<Vec<String>, ConnectorError>;

    /// Push every row selected by `spec` into `rows`.
    ///
    /// Implementations return as soon as `rows.send` fails.
    ///
    /// # Errors
    ///
    /// Returns a connector error when reading fails or the send fails.
    fn read_rows(&self, spec: &ReadSpec, rows: &mut RowSender) -> Result<(), ConnectorError>;
}

/// An endpoint rows can be written to.
pub trait TargetConnector: Send + Sync {
    /// Stage every row from `rows`, then commit into `request.object`
    /// according to `request.mode`. Nothing reaches the final object unless
    /// the stream finishes cleanly.
    ///
    /// # Errors
    ///
    /// Returns a connector error when staging or committing fails.
    fn write_rows(
        &self,
        request: &WriteRequest,
        rows: &mut RowReceiver,
    ) -> Result<WriteSummary, ConnectorError>;

    /// Current maximum of `column` in `object`, if the object exists.
    ///
    /// # Errors
    ///
    /// Returns a connector error when the lookup fails.
    fn max_value(&self, _object: &str, _column: &str) -> Result<Option<String>, ConnectorError> {
        Ok(None)
    }

    /// Run a statement against the target (pre/post SQL).
    ///
    /// # Errors
    ///
    /// Returns a connector error when the statement fails or is unsupported.
    fn execute(&self, _statement: &str) -> Result<(), ConnectorError> {
        Err(ConnectorError::config(
            "UNSUPPORTED",
            "this target does not execute statements",
        ))
    }
}

/// A resolved endpoint with the capabilities it offers.
#[derive(Clone)]
pub struct Endpoint {
    pub kind: EndpointKind,
    source: Option<Arc<dyn SourceConnector>>,
    target: Option<Arc<dyn TargetConnector>>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.kind)
            .field("readable", &self.source.is_some())
            .field("writable", &self.target.is_some())
            .finish()
    }
}

impl Endpoint {
    #[must_use]
    pub fn new(kind: EndpointKind) -> Self {
        Self {
            kind,
            source: None,
            target: None,
        }
    }

    /// An endpoint that can both read and write.
    pub fn read_write<C>(kind: EndpointKind, connector: Arc<C>) -> Self
    where
        C: SourceConnector + TargetConnector + 'static,
    {
        Self {
            kind,
            source: Some(connector.clone()),
            target: Some(connector),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn SourceConnector>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: Arc<dyn TargetConnector>) -> Self {
        self.target = Some(target);
        self
    }

    #[must_use]
    pub fn source(&self) -> Option<Arc<dyn SourceConnector>> {
        self.source.clone()
    }

    #[must_use]
    pub fn target(&self) -> Option<Arc<dyn TargetConnector>> {
        self.target.clone()
    }
}
