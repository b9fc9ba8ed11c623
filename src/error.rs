//! Error types for the Consul operator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error (pod listing, Service apply/delete)
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid or missing process-level configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A platform hook tool exited unsuccessfully
    #[error("hook tool `{tool}` failed: {message}")]
    HookToolError { tool: String, message: String },

    /// The Pebble supervisor rejected a request or was unreachable
    #[error("{0}")]
    WorkloadError(String),

    /// Key, CSR or certificate handling failed
    #[error("Certificate error: {0}")]
    CertificateError(String),

    /// Relation databag content could not be decoded
    #[error("Relation data error: {0}")]
    RelationDataError(String),
}

impl Error {
    /// Whether the same trigger is expected to succeed when redelivered
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::IoError(_)
                | Error::HookToolError { .. }
                | Error::WorkloadError(_)
        )
    }
}

impl From<rcgen::Error> for Error {
    fn from(e: rcgen::Error) -> Self {
        Error::CertificateError(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_errors_are_retriable() {
        assert!(Error::WorkloadError("connection refused".to_string()).is_retriable());
        assert!(Error::HookToolError {
            tool: "relation-set".to_string(),
            message: "exit status 1".to_string(),
        }
        .is_retriable());
    }

    #[test]
    fn test_data_errors_are_not_retriable() {
        assert!(!Error::CertificateError("bad PEM".to_string()).is_retriable());
        assert!(!Error::RelationDataError("not json".to_string()).is_retriable());
    }

    #[test]
    fn test_workload_error_displays_message_verbatim() {
        let err = Error::WorkloadError("cannot restart service: exited quickly".to_string());
        assert_eq!(err.to_string(), "cannot restart service: exited quickly");
    }
}
