//! Error types for config synthesis and engine supervision

use thiserror::Error;

/// Result type alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the synthesizer, injector and supervisor
#[derive(Debug, Error)]
pub enum EngineError {
    /// Base template is not valid JSON
    #[error("failed to parse config template: {0}")]
    TemplateParse(#[source] serde_json::Error),

    /// Inbound store read/update failed
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// An inbound record carries a malformed settings blob
    #[error("inbound {tag}: invalid {field}: {source}")]
    SettingsParse {
        tag: String,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Outbound/routing blob could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation needs a live engine
    #[error("xray is not running")]
    NotRunning,

    /// Engine process could not be spawned
    #[error("failed to start xray: {0}")]
    Spawn(#[source] std::io::Error),

    /// Engine process could not be terminated
    #[error("failed to stop xray: {0}")]
    Terminate(String),

    /// Old engine would not stop and the replacement would not start
    #[error("failed to stop xray ({stop}), then failed to start replacement ({start})")]
    RestartFailed {
        stop: Box<EngineError>,
        #[source]
        start: Box<EngineError>,
    },

    /// Engine process exited on its own
    #[error("{0}")]
    Exited(String),

    /// Stats query against the running engine failed
    #[error("traffic query failed: {0}")]
    Telemetry(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Errors that abort a synthesis pass before any process is touched
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            EngineError::TemplateParse(_)
                | EngineError::Persistence(_)
                | EngineError::SettingsParse { .. }
                | EngineError::Serialization(_)
        )
    }
}

/// Errors raised by inbound stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed inbound database: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Backend(String),
}
