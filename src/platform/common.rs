use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Atomically write content to a file
///
/// This function writes to a temporary file in the same directory,
/// applies `mode`, syncs to disk, then renames to the target path, so
/// readers observe either the old or the new content and never a mix.
pub fn atomic_write(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    // Create parent directory if it doesn't exist
    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent, 0o700)?;
    }

    // Create temporary file in same directory
    let temp_path = path.with_extension("tmp");

    {
        let mut file = File::create(&temp_path).with_context(|| {
            format!("Failed to create temporary file: {}", temp_path.display())
        })?;

        file.write_all(content)
            .context("Failed to write to temporary file")?;

        file.sync_all().context("Failed to sync file to disk")?;
    }

    set_file_permissions(&temp_path, mode)?;

    // Rename to target path (atomic operation)
    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

/// Ensure a directory exists, creating it and all parents if needed
///
/// `mode` is only applied to a directory this call creates.
pub fn ensure_directory_exists(path: &Path, mode: u32) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;

        set_file_permissions(path, mode)?;
    }

    Ok(())
}

/// Set file permissions to a specific mode
pub fn set_file_permissions(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to get metadata for: {}", path.display()))?;

        let mut permissions = metadata.permissions();
        permissions.set_mode(mode);

        std::fs::set_permissions(path, permissions)
            .with_context(|| format!("Failed to set permissions for: {}", path.display()))?;
    }

    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }

    Ok(())
}

/// Check if running with root privileges
pub fn ensure_admin_privileges() -> Result<()> {
    #[cfg(unix)]
    {
        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            anyhow::bail!(
                "This program must be run as root or with sudo. Current EUID: {}",
                euid
            );
        }
    }

    #[cfg(not(unix))]
    {
        anyhow::bail!("Managed login requires a Unix host");
    }

    Ok(())
}
