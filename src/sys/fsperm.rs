// src/sys/fsperm.rs
//
// Ownership and mode helpers shared by the TLS and NGINX stages.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::unistd::{Gid, Uid, User, chown, geteuid};
use tracing::debug;

pub fn running_as_root() -> bool {
    geteuid().is_root()
}

pub fn set_mode(path: &Path, mode: u32) -> Result<(), String> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| format!("failed to set mode {:o} on {}: {}", mode, path.display(), e))
}

#[cfg(test)]
pub fn mode_of(path: &Path) -> Result<u32, String> {
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o777)
        .map_err(|e| format!("failed to stat {}: {}", path.display(), e))
}

/// Resolves a user name to uid/gid. Numeric names are taken literally.
pub fn lookup_user(name: &str) -> Result<(Uid, Gid), String> {
    if let Ok(raw) = name.parse::<u32>() {
        return Ok((Uid::from_raw(raw), Gid::from_raw(raw)));
    }
    match User::from_name(name) {
        Ok(Some(user)) => Ok((user.uid, user.gid)),
        Ok(None) => Err(format!("user '{}' does not exist", name)),
        Err(e) => Err(format!("failed to look up user '{}': {}", name, e)),
    }
}

/// chown that is skipped when not running as root (nothing to hand over).
pub fn chown_if_root(path: &Path, uid: Uid, gid: Gid) -> Result<(), String> {
    if !running_as_root() {
        debug!(path = %path.display(), "Not root, leaving ownership unchanged");
        return Ok(());
    }
    chown(path, Some(uid), Some(gid)).map_err(|e| format!("failed to chown {}: {}", path.display(), e))
}

/// Creates `path` if needed, applies `mode` and (as root) hands it to `owner`.
pub fn ensure_dir(path: &Path, mode: u32, owner: Option<(Uid, Gid)>) -> Result<(), String> {
    fs::create_dir_all(path).map_err(|e| format!("failed to create {}: {}", path.display(), e))?;
    set_mode(path, mode)?;
    if let Some((uid, gid)) = owner {
        chown_if_root(path, uid, gid)?;
    }
    Ok(())
}

/// Walks `root` applying modes and ownership. Symlinks are never followed or touched.
pub fn secure_tree(root: &Path, dir_mode: u32, file_mode: u32, owner: Option<(Uid, Gid)>) -> Result<usize, String> {
    let meta = fs::symlink_metadata(root).map_err(|e| format!("failed to stat {}: {}", root.display(), e))?;
    if meta.file_type().is_symlink() {
        return Ok(0);
    }

    let mut touched = 1;
    if meta.is_dir() {
        set_mode(root, dir_mode)?;
        let entries = fs::read_dir(root).map_err(|e| format!("failed to read {}: {}", root.display(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| e.to_string())?;
            touched += secure_tree(&entry.path(), dir_mode, file_mode, owner)?;
        }
    } else {
        set_mode(root, file_mode)?;
    }

    if let Some((uid, gid)) = owner {
        chown_if_root(root, uid, gid)?;
    }
    Ok(touched)
}
