use hotgate_net::NetError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("User '{0}' already exists")]
    UserExists(String),

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PortalError>;

impl PortalError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
