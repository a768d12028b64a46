//! Pre-flight checks on a model file before handing it to llama.cpp.

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use gguf_parser::GGUFError;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// A path that exists, is readable, and starts with a supported GGUF header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFile {
    path: PathBuf,
    size: u64,
}

impl ModelFile {
    /// Validate `path`. A size different from `expected_size` is only
    /// logged; the file on disk is what gets loaded.
    pub fn validate(path: &Path, expected_size: Option<u64>) -> Result<Self> {
        let shown = path.display().to_string();

        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BridgeError::ModelFileMissing(shown));
            }
            Err(e) => return Err(BridgeError::ModelFileUnreadable(format!("{shown} ({e})"))),
        };
        if !meta.is_file() {
            return Err(BridgeError::ModelFileUnreadable(format!(
                "{shown} is not a regular file"
            )));
        }

        File::open(path)
            .map_err(|e| BridgeError::ModelFileUnreadable(format!("{shown} ({e})")))?;

        let header = gguf_parser::probe(path).map_err(|e| match e {
            GGUFError::Io(io) => BridgeError::ModelFileUnreadable(format!("{shown} ({io})")),
            other => BridgeError::UnsupportedFormat(format!(
                "{shown} is not a supported model ({other}). Only GGUF models are supported at this time."
            )),
        })?;

        if let Some(expected) = expected_size
            && expected != meta.len()
        {
            warn!(
                path = %shown,
                actual = meta.len(),
                expected,
                "Model file size does not match metadata"
            );
        }

        debug!(path = %shown, version = header.version, tensors = header.tensor_count, "Model file validated");
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Header-only GGUF v3 file: enough for validation, not for loading.
    pub(crate) fn write_stub_gguf(path: &Path) {
        let mut bytes = 0x4655_4747u32.to_le_bytes().to_vec();
        bytes.extend(3u32.to_le_bytes());
        bytes.extend(0u64.to_le_bytes());
        bytes.extend(0u64.to_le_bytes());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn accepts_gguf_header() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("m.gguf");
        write_stub_gguf(&path);
        let file = ModelFile::validate(&path, Some(999)).unwrap();
        assert_eq!(file.path(), path);
        assert_eq!(file.size(), 24);
    }

    #[test]
    fn missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ModelFile::validate(&tmp.path().join("gone.gguf"), None).unwrap_err();
        assert!(matches!(err, BridgeError::ModelFileMissing(_)));
    }

    #[test]
    fn directory_is_not_a_model() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ModelFile::validate(tmp.path(), None).unwrap_err();
        assert!(matches!(err, BridgeError::ModelFileUnreadable(_)));
    }

    #[test]
    fn other_formats_are_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("model.safetensors");
        std::fs::write(&path, b"\x08\x00\x00\x00\x00\x00\x00\x00{}").unwrap();
        let err = ModelFile::validate(&path, None).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedFormat(ref m) if m.contains("Only GGUF")));
    }

    #[test]
    fn truncated_gguf_is_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("short.gguf");
        std::fs::write(&path, b"GGUF").unwrap();
        let err = ModelFile::validate(&path, None).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedFormat(_)));
    }
}
