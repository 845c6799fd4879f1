use std::path::{Path, PathBuf};

/// Get the base storage directory following XDG Base Directory Specification.
/// Returns `$XDG_DATA_HOME/replaybuf`, falling back to the platform data dir.
pub fn get_storage_dir() -> PathBuf {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg_data).join("replaybuf");
    }

    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("replaybuf")
}

/// Get the logs directory path.
/// Returns `{storage_dir}/logs`.
pub fn get_log_dir() -> PathBuf {
    get_storage_dir().join("logs")
}

/// Default scratch directory for in-flight and retained segments.
/// Prefers RAM-backed `/dev/shm` when it exists.
pub fn default_scratch_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if cfg!(target_os = "linux") && shm.is_dir() {
        return shm.join("replaybuf");
    }
    std::env::temp_dir().join("replaybuf")
}

/// Default directory for finished exports.
pub fn default_output_dir() -> PathBuf {
    dirs::video_dir()
        .map(|dir| dir.join("replaybuf"))
        .unwrap_or_else(|| get_storage_dir().join("recordings"))
}

/// Ensure a directory exists, creating it if necessary.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
