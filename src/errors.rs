use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::inventory::SearchError;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("{kind} record is missing required field `{field}`")]
    MissingField { kind: &'static str, field: &'static str },
    #[error("invalid search filter `{filter}`: {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("failed to render template {template}: {message}")]
    Template { template: String, message: String },
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown system user `{0}`")]
    UnknownUser(String),
    #[error("unknown system group `{0}`")]
    UnknownGroup(String),
    #[error("command `{command}` failed with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("systemd: {0}")]
    Systemd(String),
    #[error("certificate subject `{0}` must look like /C=US/O=Example/CN=host")]
    InvalidSubject(String),
}

impl ProvisionError {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn systemd(message: impl Into<String>) -> Self {
        Self::Systemd(message.into())
    }

    pub fn missing_field(kind: &'static str, field: &'static str) -> Self {
        Self::MissingField { kind, field }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_names_kind_and_field() {
        let err = ProvisionError::missing_field("node", "hostname");
        assert_eq!(
            err.to_string(),
            "node record is missing required field `hostname`"
        );
    }

    #[test]
    fn io_error_mentions_path() {
        let err = ProvisionError::io(
            "failed to create directory",
            "/etc/nagios3/dist",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        let message = err.to_string();
        assert!(message.starts_with("failed to create directory /etc/nagios3/dist"));
    }
}
