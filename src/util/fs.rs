use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| Error::io_context(e, format!("create directory {}", path.display())))?;
    }
    set_permissions(path, mode)
}

pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let perm = fs::Permissions::from_mode(mode);
        fs::set_permissions(path, perm).map_err(|e| {
            Error::io_context(e, format!("set permissions {:o} on {}", mode, path.display()))
        })?;
    }
    Ok(())
}

/// Permission bits of `path`, if it can be inspected.
#[cfg(unix)]
pub fn mode_of(path: &Path) -> Option<u32> {
    fs::metadata(path)
        .ok()
        .map(|m| m.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
pub fn mode_of(_path: &Path) -> Option<u32> {
    None
}

/// Write `data` next to `path`, fsync it, then rename it into place.
///
/// Readers observe either the old file or the complete new one. With
/// `clobber == false` an existing target is an error and is left untouched.
pub fn write_atomic(path: &Path, data: &[u8], mode: u32, clobber: bool) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)
        .map_err(|e| Error::io_context(e, format!("create temp file in {}", parent.display())))?;

    #[cfg(unix)]
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io_context(e, "set permissions on temp file"))?;
    #[cfg(not(unix))]
    let _ = mode;

    tmp.write_all(data)
        .map_err(|e| Error::io_context(e, format!("write {}", path.display())))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io_context(e, format!("sync {}", path.display())))?;

    let persisted = if clobber {
        tmp.persist(path).map_err(|e| e.error)
    } else {
        tmp.persist_noclobber(path).map_err(|e| e.error)
    };
    persisted.map_err(|e| Error::io_context(e, format!("persist {}", path.display())))?;
    sync_dir(parent);
    Ok(())
}

/// Best-effort fsync of a directory so a completed rename survives a crash.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}
