//! App-managed storage: directory layout, free space, atomic writes.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

const APP_DIR: &str = "ThothAI";

/// `<root>/{KnowledgeBases,Models,Settings}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Platform data directory (`~/Library/Application Support/ThothAI` on
    /// Apple platforms, `$XDG_DATA_HOME/ThothAI` on Linux).
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn knowledge_bases_dir(&self) -> PathBuf {
        self.root.join("KnowledgeBases")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("Models")
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.root.join("Settings")
    }

    /// Create the root and all sub-directories that are missing.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [
            self.root.clone(),
            self.knowledge_bases_dir(),
            self.models_dir(),
            self.settings_dir(),
        ] {
            if !dir.is_dir() {
                std::fs::create_dir_all(&dir)?;
                debug!(dir = %dir.display(), "Created storage directory");
            }
        }
        Ok(())
    }

    /// Bytes available to the current user on the volume holding the root,
    /// or `None` if it cannot be determined.
    pub fn free_space(&self) -> Option<u64> {
        let probe = self.root.ancestors().find(|p| p.exists())?;
        match fs2::available_space(probe) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(path = %probe.display(), "Cannot query free space: {e}");
                None
            }
        }
    }

    /// [`free_space`](Self::free_space) formatted for display.
    pub fn free_space_string(&self) -> String {
        self.free_space()
            .map(human_size)
            .unwrap_or_else(|| "Unknown".into())
    }
}

/// Replace `path` with `data` so readers see either the old or the new
/// content, never a partial write. Parent directories are created.
pub fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// `1536` → `1.5 KiB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    for &unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PiB")
}
