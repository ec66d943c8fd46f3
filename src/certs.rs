use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;
use tracing::info;

use crate::errors::ProvisionError;
use crate::system::{run_guarded, CommandSpec, SystemManager};

pub const KEY_FILE: &str = "nagios-server.key";
pub const CERT_FILE: &str = "nagios-server.crt";
pub const BUNDLE_FILE: &str = "nagios-server.pem";
pub const VALIDITY_DAYS: u32 = 3650;
pub const KEY_BITS: u32 = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub key: PathBuf,
    pub certificate: PathBuf,
    pub bundle: PathBuf,
}

impl CertificatePaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            key: dir.join(KEY_FILE),
            certificate: dir.join(CERT_FILE),
            bundle: dir.join(BUNDLE_FILE),
        }
    }
}

fn subject_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(/[A-Za-z][A-Za-z0-9.]*=[^/]+)+$").expect("subject pattern is valid")
    })
}

pub fn validate_subject(subject: &str) -> Result<(), ProvisionError> {
    if subject_pattern().is_match(subject) {
        Ok(())
    } else {
        Err(ProvisionError::InvalidSubject(subject.to_string()))
    }
}

/// Generates the key, self-signed certificate and their bundle in `dir`.
///
/// Nothing is done when the bundle already exists. Returns whether a new
/// triple was produced.
pub async fn ensure_certificate_bundle(
    system: &dyn SystemManager,
    dir: &Path,
    subject: &str,
) -> Result<bool, ProvisionError> {
    let paths = CertificatePaths::in_dir(dir);
    if paths.bundle.exists() {
        info!(bundle = %paths.bundle.display(), "certificate bundle present, skipping generation");
        return Ok(false);
    }
    validate_subject(subject)?;

    let bits = KEY_BITS.to_string();
    let days = VALIDITY_DAYS.to_string();
    let generate_key = CommandSpec::new("openssl")
        .args(["genrsa", "-out", KEY_FILE, bits.as_str()])
        .current_dir(dir)
        .unless_exists(&paths.bundle);
    let self_sign = CommandSpec::new("openssl")
        .args(["req", "-subj", subject, "-new", "-x509", "-nodes", "-sha256"])
        .args(["-days", days.as_str(), "-key", KEY_FILE, "-out", CERT_FILE])
        .current_dir(dir)
        .unless_exists(&paths.bundle);

    run_guarded(system, &generate_key).await?;
    restrict(&paths.key)?;
    run_guarded(system, &self_sign).await?;

    let mut bundle = fs::read(&paths.key)
        .map_err(|err| ProvisionError::io("failed to read", &paths.key, err))?;
    bundle.extend(
        fs::read(&paths.certificate)
            .map_err(|err| ProvisionError::io("failed to read", &paths.certificate, err))?,
    );
    fs::write(&paths.bundle, bundle)
        .map_err(|err| ProvisionError::io("failed to write", &paths.bundle, err))?;
    restrict(&paths.certificate)?;
    restrict(&paths.bundle)?;

    info!(dir = %dir.display(), subject, "self-signed certificate generated");
    Ok(true)
}

fn restrict(path: &Path) -> Result<(), ProvisionError> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|err| ProvisionError::io("failed to set mode on", path, err))
}
