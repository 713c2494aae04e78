//! Data directory for persistent storage.
//!
//! Defaults to `~/.blazeit/` but can be overridden via `--conf`. Holds the
//! remembered session (`session.json`), logs, and the default downloads
//! folder.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

/// Resolve the data directory: `custom` when given, otherwise `~/.blazeit`.
pub fn resolve(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(p) => Ok(p.to_path_buf()),
        None => dirs::home_dir()
            .map(|home| home.join(".blazeit"))
            .ok_or_else(|| anyhow!("No home directory found; pass --conf <dir>")),
    }
}

/// Log file location inside the data directory.
pub fn log_file(data_dir: &Path) -> PathBuf {
    data_dir.join("logs").join("blazeit.log")
}

/// Default folder received files are written to.
pub fn downloads(data_dir: &Path) -> PathBuf {
    data_dir.join("downloads")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_dir_wins() {
        let dir = resolve(Some(Path::new("/tmp/blazeit-conf"))).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/blazeit-conf"));
        assert_eq!(
            log_file(&dir),
            PathBuf::from("/tmp/blazeit-conf/logs/blazeit.log")
        );
    }
}
