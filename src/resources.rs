//! Convergent file-system resources
//!
//! Each helper checks current state first and only touches the disk when it
//! differs, so a provisioning run can be repeated safely.

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use nix::unistd::{chown, Group, User};
use tracing::{debug, info};

use crate::errors::ProvisionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    pub owner: Option<String>,
    pub group: Option<String>,
}

impl Ownership {
    pub fn new(owner: Option<&str>, group: Option<&str>) -> Self {
        Self {
            owner: owner.map(str::to_string),
            group: group.map(str::to_string),
        }
    }

    pub fn unmanaged() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    pub path: PathBuf,
    pub mode: u32,
    pub ownership: Ownership,
}

impl PathSpec {
    pub fn new(path: impl Into<PathBuf>, mode: u32, ownership: Ownership) -> Self {
        Self {
            path: path.into(),
            mode,
            ownership,
        }
    }
}

/// Creates the directory if absent and enforces mode and ownership.
pub fn ensure_directory(spec: &PathSpec) -> Result<bool, ProvisionError> {
    let created = !spec.path.is_dir();
    if created {
        fs::create_dir_all(&spec.path)
            .map_err(|err| ProvisionError::io("failed to create directory", &spec.path, err))?;
        info!(path = %spec.path.display(), "directory created");
    }

    apply_mode(&spec.path, spec.mode)?;
    apply_ownership(&spec.path, &spec.ownership)?;
    Ok(created)
}

/// Writes `contents` when they differ from what is on disk.
pub fn write_file(spec: &PathSpec, contents: &str) -> Result<bool, ProvisionError> {
    let changed = match fs::read(&spec.path) {
        Ok(existing) => existing != contents.as_bytes(),
        Err(_) => true,
    };

    if changed {
        if let Some(parent) = spec.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| ProvisionError::io("failed to create directory", parent, err))?;
        }

        let staging = staging_path(&spec.path);
        fs::write(&staging, contents)
            .map_err(|err| ProvisionError::io("failed to write", &staging, err))?;
        fs::rename(&staging, &spec.path)
            .map_err(|err| ProvisionError::io("failed to replace", &spec.path, err))?;
        info!(path = %spec.path.display(), bytes = contents.len(), "file updated");
    } else {
        debug!(path = %spec.path.display(), "file up to date");
    }

    apply_mode(&spec.path, spec.mode)?;
    apply_ownership(&spec.path, &spec.ownership)?;
    Ok(changed)
}

pub fn remove_file(path: &Path) -> Result<bool, ProvisionError> {
    if path.symlink_metadata().is_err() {
        return Ok(false);
    }

    fs::remove_file(path).map_err(|err| ProvisionError::io("failed to delete", path, err))?;
    info!(path = %path.display(), "file deleted");
    Ok(true)
}

/// Moves files in `dir` matching the glob `pattern` into `destination`.
pub fn archive_matching(
    dir: &Path,
    pattern: &str,
    destination: &Path,
) -> Result<Vec<PathBuf>, ProvisionError> {
    let expression = dir.join(pattern);
    let expression = expression.to_string_lossy();
    let matches = glob::glob(&expression).map_err(|err| {
        ProvisionError::io(
            "invalid archive pattern for",
            dir,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()),
        )
    })?;

    let mut archived = Vec::new();
    for entry in matches {
        let source = entry.map_err(|err| {
            let path = err.path().to_path_buf();
            ProvisionError::io("failed to read", path, err.into_error())
        })?;
        let Some(file_name) = source.file_name() else {
            continue;
        };

        let target = destination.join(file_name);
        fs::rename(&source, &target)
            .map_err(|err| ProvisionError::io("failed to archive", &source, err))?;
        info!(from = %source.display(), to = %target.display(), "archived vendor file");
        archived.push(target);
    }

    Ok(archived)
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.staging"))
}

fn apply_mode(path: &Path, mode: u32) -> Result<(), ProvisionError> {
    let current = fs::metadata(path)
        .map_err(|err| ProvisionError::io("failed to inspect", path, err))?
        .permissions()
        .mode()
        & 0o7777;
    if current == mode {
        return Ok(());
    }

    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|err| ProvisionError::io("failed to set mode on", path, err))
}

fn apply_ownership(path: &Path, ownership: &Ownership) -> Result<(), ProvisionError> {
    if ownership.owner.is_none() && ownership.group.is_none() {
        return Ok(());
    }

    let uid = match &ownership.owner {
        Some(name) => Some(
            User::from_name(name)
                .ok()
                .flatten()
                .ok_or_else(|| ProvisionError::UnknownUser(name.clone()))?
                .uid,
        ),
        None => None,
    };
    let gid = match &ownership.group {
        Some(name) => Some(
            Group::from_name(name)
                .ok()
                .flatten()
                .ok_or_else(|| ProvisionError::UnknownGroup(name.clone()))?
                .gid,
        ),
        None => None,
    };

    chown(path, uid, gid)
        .map_err(|errno| ProvisionError::io("failed to change ownership of", path, errno.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).expect("metadata").permissions().mode() & 0o7777
    }

    #[test]
    fn directory_is_created_once() {
        let root = tempfile::tempdir().expect("temp dir");
        let spec = PathSpec::new(root.path().join("rw"), 0o2710, Ownership::unmanaged());

        assert!(ensure_directory(&spec).expect("create"));
        assert!(!ensure_directory(&spec).expect("converged"));
        assert_eq!(mode_of(&spec.path), 0o2710);
    }

    #[test]
    fn file_is_only_rewritten_on_change() {
        let root = tempfile::tempdir().expect("temp dir");
        let spec = PathSpec::new(
            root.path().join("conf.d/hosts.cfg"),
            0o644,
            Ownership::unmanaged(),
        );

        assert!(write_file(&spec, "define host {}\n").expect("write"));
        assert!(!write_file(&spec, "define host {}\n").expect("same content"));
        assert!(write_file(&spec, "define host { }\n").expect("new content"));
        assert_eq!(
            fs::read_to_string(&spec.path).expect("read"),
            "define host { }\n"
        );
        assert_eq!(mode_of(&spec.path), 0o644);
        assert!(!root.path().join("conf.d/.hosts.cfg.staging").exists());
    }

    #[test]
    fn remove_reports_whether_anything_was_deleted() {
        let root = tempfile::tempdir().expect("temp dir");
        let path = root.path().join("nagios3.conf");
        fs::write(&path, "Alias /nagios3").expect("write");

        assert!(remove_file(&path).expect("delete"));
        assert!(!remove_file(&path).expect("already gone"));
    }

    #[test]
    fn vendor_files_are_archived() {
        let root = tempfile::tempdir().expect("temp dir");
        let config_dir = root.path().join("conf.d");
        let dist = root.path().join("dist");
        fs::create_dir_all(&config_dir).expect("config dir");
        fs::create_dir_all(&dist).expect("dist dir");
        fs::write(config_dir.join("localhost_nagios2.cfg"), "x").expect("write");
        fs::write(config_dir.join("hosts.cfg"), "y").expect("write");

        let archived = archive_matching(&config_dir, "*_nagios*.cfg", &dist).expect("archive");
        assert_eq!(archived, vec![dist.join("localhost_nagios2.cfg")]);
        assert!(config_dir.join("hosts.cfg").exists());
        assert!(!config_dir.join("localhost_nagios2.cfg").exists());

        assert!(archive_matching(&config_dir, "*_nagios*.cfg", &dist)
            .expect("nothing left")
            .is_empty());
    }

    #[test]
    fn unknown_owner_is_rejected() {
        let root = tempfile::tempdir().expect("temp dir");
        let spec = PathSpec::new(
            root.path().join("certificates"),
            0o700,
            Ownership::new(Some("no-such-user-for-nagios-tests"), None),
        );

        let err = ensure_directory(&spec).expect_err("expected unknown user");
        assert!(matches!(err, ProvisionError::UnknownUser(name) if name == "no-such-user-for-nagios-tests"));
    }
}
