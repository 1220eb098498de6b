use std::path::PathBuf;

use reqwest::StatusCode;

/// Failure talking to a remote endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Network, DNS, TLS or timeout failure.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// A 2xx response was required but something else came back.
    #[error("unexpected HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl TransportError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Request(err) => err.status(),
            Self::Status { status, .. } => Some(*status),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("FlareProx not configured")]
    NotConfigured,

    #[error("could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is required")]
    MissingValue(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum FlareProxError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to {operation}: {cause}")]
    Deployment {
        operation: &'static str,
        #[source]
        cause: TransportError,
    },

    #[error("terminal I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl FlareProxError {
    pub fn deployment(operation: &'static str, cause: impl Into<TransportError>) -> Self {
        Self::Deployment {
            operation,
            cause: cause.into(),
        }
    }
}

pub type Result<T, E = FlareProxError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_failures_convert_into_io_variant() {
        let err: FlareProxError =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "stdin closed").into();

        assert!(matches!(err, FlareProxError::Io(ref source)
            if source.kind() == std::io::ErrorKind::UnexpectedEof));
        assert_eq!(err.to_string(), "terminal I/O failed: stdin closed");
    }

    #[test]
    fn config_errors_keep_their_message() {
        let err: FlareProxError = ConfigError::MissingValue("API token").into();
        assert_eq!(err.to_string(), "API token is required");
    }
}
