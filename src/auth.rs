use std::path::PathBuf;

use crate::config::Config;

/// How the web front end authenticates operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    OpenId,
    Htpasswd,
}

impl AuthMethod {
    /// `openid` selects federated identity; anything else falls back to a
    /// basic-auth credentials file.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("openid") {
            Self::OpenId
        } else {
            Self::Htpasswd
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPlan {
    EnableModule { module: &'static str },
    CredentialsFile { path: PathBuf },
}

impl AuthPlan {
    pub fn for_config(config: &Config) -> Self {
        match config.auth_method {
            AuthMethod::OpenId => Self::EnableModule {
                module: "auth_openid",
            },
            AuthMethod::Htpasswd => Self::CredentialsFile {
                path: config.conf_dir.join("htpasswd.users"),
            },
        }
    }

    pub fn writes_credentials(&self) -> bool {
        matches!(self, Self::CredentialsFile { .. })
    }
}
