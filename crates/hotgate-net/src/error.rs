use thiserror::Error;

/// Unified error type for hotgate-net operations.
///
/// Variants carry enough context (command line, interface, rule) to tell what
/// failed without cross-referencing the debug log.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{command}' exited with {exit_code}: stdout={stdout:?} stderr={stderr:?}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Radio is still blocked after unblocking: {state}")]
    RadioBlocked { state: String },

    #[error("{daemon} is not running after start: {detail}")]
    DaemonNotRunning { daemon: String, detail: String },

    #[error("Expected firewall rule is missing: {rule}")]
    MissingRule { rule: String },

    #[error("Nothing is listening on {proto} port {port}")]
    ListenerMissing { proto: String, port: u16 },

    #[error("Invalid MAC address '{0}'")]
    InvalidMac(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("IO error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, NetError>;

impl NetError {
    pub fn io_error(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_rule(rule: impl std::fmt::Display) -> Self {
        Self::MissingRule {
            rule: rule.to_string(),
        }
    }
}
