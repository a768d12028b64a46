//! GGUF header and metadata reader.

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::*;

/// Stop reading metadata after this many bytes. Tokenizer vocab arrays
/// dominate the metadata of large-vocab models; 8 MiB covers them.
const SCAN_LIMIT: u64 = 8 * 1024 * 1024;

const MAX_STRING_LEN: u64 = 1 << 24;
const MAX_ARRAY_LEN: u64 = 1 << 24;

/// What [`quick_scan`] learned about a model file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    pub path: PathBuf,
    pub file_size: u64,
    pub header: GGUFHeader,
    pub architecture: Option<String>,
    pub name: Option<String>,
    pub quantization: Option<String>,
    pub context_length: Option<u32>,
    pub chat_template: Option<String>,
    /// Metadata KVs read before the scan limit, tokenizer arrays excluded.
    pub metadata: Vec<GGUFMetadataKV>,
}

/// One model found by [`list_models`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
    /// First (or only) file of the model.
    pub path: PathBuf,
    /// Total size of all shards.
    pub file_size: u64,
    pub architecture: Option<String>,
    pub quantization: Option<String>,
    pub context_length: Option<u32>,
    pub shards: Vec<PathBuf>,
}

/// Validate the fixed-size GGUF header of `path`.
pub fn probe(path: &Path) -> Result<GGUFHeader, GGUFError> {
    let file = fs::File::open(path)?;
    probe_reader(&mut BufReader::new(file))
}

/// Like [`probe`], from any reader positioned at the start of the file.
pub fn probe_reader(r: &mut impl Read) -> Result<GGUFHeader, GGUFError> {
    let magic = header_u32(r)?;
    if magic != GGUF_MAGIC {
        return Err(GGUFError::InvalidMagic(magic));
    }
    let version = header_u32(r)?;
    if !(GGUF_VERSION_MIN..=GGUF_VERSION_MAX).contains(&version) {
        return Err(GGUFError::UnsupportedVersion(version));
    }
    Ok(GGUFHeader {
        version,
        tensor_count: header_u64(r)?,
        metadata_kv_count: header_u64(r)?,
    })
}

/// Read the header and leading metadata of `path`.
pub fn quick_scan(path: &Path) -> Result<ModelSummary, GGUFError> {
    let file = fs::File::open(path)?;
    let file_size = file.metadata()?.len();
    let mut reader = CountingReader::new(BufReader::new(file));

    let header = probe_reader(&mut reader)?;
    let limit = file_size.min(SCAN_LIMIT);

    let mut metadata = Vec::new();
    for _ in 0..header.metadata_kv_count {
        if reader.consumed >= limit {
            break;
        }
        match read_kv(&mut reader) {
            Ok(kv) if kv.key.starts_with("tokenizer.ggml.") => {}
            Ok(kv) => metadata.push(kv),
            Err(GGUFError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }

    let kv: HashMap<&str, &GGUFValue> = metadata
        .iter()
        .map(|kv| (kv.key.as_str(), &kv.value))
        .collect();
    let text = |key: &str| kv.get(key).and_then(|v| v.as_str()).map(String::from);

    let architecture = text("general.architecture");
    let name = text("general.name");
    let chat_template = text("tokenizer.chat_template");
    let arch = architecture.as_deref().unwrap_or("llama");
    let context_length = kv
        .get(format!("{arch}.context_length").as_str())
        .and_then(|v| v.as_u32());
    let quantization = kv
        .get("general.file_type")
        .and_then(|v| v.as_u32())
        .map(|ft| file_type_name(ft).to_string());
    drop(kv);

    let summary = ModelSummary {
        path: path.to_path_buf(),
        file_size,
        header,
        name,
        chat_template,
        architecture,
        quantization,
        context_length,
        metadata,
    };
    debug!(path = %path.display(), arch = ?summary.architecture, "GGUF scanned");
    Ok(summary)
}

/// Find every GGUF model below `dir`, sorted by path.
///
/// Split models (`name-00001-of-00003.gguf`) become a single entry whose
/// `shards` lists all parts. Files that fail to parse are skipped with a
/// warning. A missing directory yields an empty list.
pub fn list_models(dir: &Path) -> Result<Vec<ModelEntry>, GGUFError> {
    let mut files = Vec::new();
    collect_gguf(dir, &mut files)?;
    files.sort();

    let mut entries: Vec<ModelEntry> = Vec::new();
    let mut by_base: HashMap<PathBuf, usize> = HashMap::new();

    for path in files {
        let fname = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        let split_key = split_base(&fname).map(|base| path.with_file_name(base));
        if let Some(&idx) = split_key.as_ref().and_then(|k| by_base.get(k)) {
            let entry: &mut ModelEntry = &mut entries[idx];
            entry.file_size += fs::metadata(&path).map_or(0, |m| m.len());
            entry.shards.push(path);
            continue;
        }

        let summary = match quick_scan(&path) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), "Skipping unreadable GGUF: {e}");
                continue;
            }
        };

        if let Some(key) = split_key {
            by_base.insert(key, entries.len());
        }
        let stem = fname.trim_end_matches(".gguf").to_string();
        entries.push(ModelEntry {
            id: model_id(&stem),
            name: summary.name.unwrap_or(stem),
            file_size: summary.file_size,
            architecture: summary.architecture,
            quantization: summary.quantization,
            context_length: summary.context_length,
            shards: vec![path.clone()],
            path,
        });
    }

    Ok(entries)
}

fn collect_gguf(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), GGUFError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // Symlinked directories are not followed, so cycles cannot recurse.
        if entry.file_type()?.is_dir() {
            collect_gguf(&path, out)?;
        } else if path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("gguf"))
        {
            out.push(path);
        }
    }
    Ok(())
}

/// `base-00002-of-00005.gguf` → `base`.
fn split_base(filename: &str) -> Option<&str> {
    let stem = filename.strip_suffix(".gguf")?;
    let (rest, total) = stem.rsplit_once("-of-")?;
    let (base, part) = rest.rsplit_once('-')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    (digits(part) && digits(total) && !base.is_empty()).then_some(base)
}

fn model_id(stem: &str) -> String {
    let stem = split_base(&format!("{stem}.gguf"))
        .map(str::to_string)
        .unwrap_or_else(|| stem.to_string());
    stem.to_lowercase().replace(' ', "-")
}

//  Binary primitives

/// Tracks how far into the file we are without needing `Seek`.
struct CountingReader<R> {
    inner: R,
    consumed: u64,
}

impl<R: Read> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, consumed: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        Ok(n)
    }
}

fn header_u32(r: &mut impl Read) -> Result<u32, GGUFError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| GGUFError::TruncatedHeader)?;
    Ok(u32::from_le_bytes(buf))
}

fn header_u64(r: &mut impl Read) -> Result<u64, GGUFError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .map_err(|_| GGUFError::TruncatedHeader)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_array<const N: usize>(r: &mut impl Read) -> Result<[u8; N], GGUFError> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_string(r: &mut impl Read) -> Result<String, GGUFError> {
    let len = u64::from_le_bytes(read_array(r)?);
    if len > MAX_STRING_LEN {
        return Err(GGUFError::Other(format!("string length {len} too large")));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn read_value(r: &mut impl Read, vtype: GGUFValueType) -> Result<GGUFValue, GGUFError> {
    use GGUFValueType as T;
    Ok(match vtype {
        T::Uint8 => GGUFValue::Uint8(u8::from_le_bytes(read_array(r)?)),
        T::Int8 => GGUFValue::Int8(i8::from_le_bytes(read_array(r)?)),
        T::Uint16 => GGUFValue::Uint16(u16::from_le_bytes(read_array(r)?)),
        T::Int16 => GGUFValue::Int16(i16::from_le_bytes(read_array(r)?)),
        T::Uint32 => GGUFValue::Uint32(u32::from_le_bytes(read_array(r)?)),
        T::Int32 => GGUFValue::Int32(i32::from_le_bytes(read_array(r)?)),
        T::Float32 => GGUFValue::Float32(f32::from_le_bytes(read_array(r)?)),
        T::Bool => GGUFValue::Bool(u8::from_le_bytes(read_array(r)?) != 0),
        T::String => GGUFValue::String(read_string(r)?),
        T::Uint64 => GGUFValue::Uint64(u64::from_le_bytes(read_array(r)?)),
        T::Int64 => GGUFValue::Int64(i64::from_le_bytes(read_array(r)?)),
        T::Float64 => GGUFValue::Float64(f64::from_le_bytes(read_array(r)?)),
        T::Array => {
            let elem = GGUFValueType::try_from(u32::from_le_bytes(read_array(r)?))?;
            // llama.cpp rejects these too; recursing on them is unbounded.
            if elem == T::Array {
                return Err(GGUFError::NestedArray);
            }
            let count = u64::from_le_bytes(read_array(r)?);
            if count > MAX_ARRAY_LEN {
                return Err(GGUFError::Other(format!("array length {count} too large")));
            }
            let mut items = Vec::with_capacity((count as usize).min(1024));
            for _ in 0..count {
                items.push(read_value(r, elem)?);
            }
            GGUFValue::Array(items)
        }
    })
}

fn read_kv(r: &mut impl Read) -> Result<GGUFMetadataKV, GGUFError> {
    let key = read_string(r)?;
    let vtype = GGUFValueType::try_from(u32::from_le_bytes(read_array(r)?))?;
    let value = read_value(r, vtype)?;
    Ok(GGUFMetadataKV { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Minimal GGUF v3 writer for metadata-only test files.
    struct Builder {
        kvs: Vec<u8>,
        count: u64,
    }

    impl Builder {
        fn new() -> Self {
            Self {
                kvs: Vec::new(),
                count: 0,
            }
        }

        fn key(&mut self, key: &str, tag: u32) {
            self.kvs.extend((key.len() as u64).to_le_bytes());
            self.kvs.extend(key.as_bytes());
            self.kvs.extend(tag.to_le_bytes());
            self.count += 1;
        }

        fn string(mut self, key: &str, value: &str) -> Self {
            self.key(key, 8);
            self.kvs.extend((value.len() as u64).to_le_bytes());
            self.kvs.extend(value.as_bytes());
            self
        }

        fn u32(mut self, key: &str, value: u32) -> Self {
            self.key(key, 4);
            self.kvs.extend(value.to_le_bytes());
            self
        }

        fn string_array(mut self, key: &str, values: &[&str]) -> Self {
            self.key(key, 9);
            self.kvs.extend(8u32.to_le_bytes());
            self.kvs.extend((values.len() as u64).to_le_bytes());
            for v in values {
                self.kvs.extend((v.len() as u64).to_le_bytes());
                self.kvs.extend(v.as_bytes());
            }
            self
        }

        /// `depth` levels of `array<array<…<u8>>>`, each holding one element.
        fn nested_array(mut self, key: &str, depth: usize) -> Self {
            self.key(key, 9);
            for _ in 1..depth {
                self.kvs.extend(9u32.to_le_bytes());
                self.kvs.extend(1u64.to_le_bytes());
            }
            self.kvs.extend(0u32.to_le_bytes());
            self.kvs.extend(1u64.to_le_bytes());
            self.kvs.push(7);
            self
        }

        fn bytes(&self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend(GGUF_MAGIC.to_le_bytes());
            out.extend(3u32.to_le_bytes());
            out.extend(0u64.to_le_bytes());
            out.extend(self.count.to_le_bytes());
            out.extend(&self.kvs);
            out
        }

        fn write(&self, path: &Path) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, self.bytes()).unwrap();
        }
    }

    fn tiny_llama() -> Builder {
        Builder::new()
            .string("general.architecture", "llama")
            .string("general.name", "Tiny Llama")
            .u32("general.file_type", 15)
            .u32("llama.context_length", 2048)
            .string_array("tokenizer.ggml.tokens", &["<s>", "</s>", "a"])
            .string("tokenizer.chat_template", "{{ messages }}")
    }

    #[test]
    fn probe_accepts_v3_header() {
        let bytes = tiny_llama().bytes();
        let header = probe_reader(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 0);
        assert_eq!(header.metadata_kv_count, 6);
    }

    #[test]
    fn probe_rejects_other_formats() {
        let err = probe_reader(&mut Cursor::new(b"PK\x03\x04rest-of-zip".to_vec())).unwrap_err();
        assert!(matches!(err, GGUFError::InvalidMagic(_)));
    }

    #[test]
    fn probe_rejects_v1_and_future_versions() {
        for version in [1u32, 4] {
            let mut bytes = GGUF_MAGIC.to_le_bytes().to_vec();
            bytes.extend(version.to_le_bytes());
            bytes.extend([0u8; 16]);
            let err = probe_reader(&mut Cursor::new(bytes)).unwrap_err();
            assert!(matches!(err, GGUFError::UnsupportedVersion(v) if v == version));
        }
    }

    #[test]
    fn probe_reports_truncation() {
        let bytes = tiny_llama().bytes()[..10].to_vec();
        let err = probe_reader(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, GGUFError::TruncatedHeader));
    }

    #[test]
    fn quick_scan_extracts_well_known_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.gguf");
        tiny_llama().write(&path);

        let summary = quick_scan(&path).unwrap();
        assert_eq!(summary.architecture.as_deref(), Some("llama"));
        assert_eq!(summary.name.as_deref(), Some("Tiny Llama"));
        assert_eq!(summary.quantization.as_deref(), Some("Q4_K_M"));
        assert_eq!(summary.context_length, Some(2048));
        assert_eq!(summary.chat_template.as_deref(), Some("{{ messages }}"));
        assert!(
            summary
                .metadata
                .iter()
                .all(|kv| !kv.key.starts_with("tokenizer.ggml."))
        );
    }

    #[test]
    fn quick_scan_tolerates_metadata_cut_short() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.gguf");
        let bytes = tiny_llama().bytes();
        fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let summary = quick_scan(&path).unwrap();
        assert_eq!(summary.name.as_deref(), Some("Tiny Llama"));
        assert_eq!(summary.chat_template, None);
    }

    #[test]
    fn split_names() {
        assert_eq!(split_base("qwen-7b-00001-of-00003.gguf"), Some("qwen-7b"));
        assert_eq!(split_base("qwen-7b.gguf"), None);
        assert_eq!(split_base("-00001-of-00002.gguf"), None);
        assert_eq!(split_base("model-x-of-00002.gguf"), None);
    }

    #[test]
    fn list_models_groups_shards_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        tiny_llama().write(&root.join("a/Tiny Model.gguf"));
        Builder::new()
            .string("general.name", "Big")
            .write(&root.join("big-00001-of-00002.gguf"));
        fs::write(root.join("big-00002-of-00002.gguf"), b"tensor data").unwrap();
        fs::write(root.join("notes.txt"), b"ignore me").unwrap();
        fs::write(root.join("broken.gguf"), b"nope").unwrap();

        let models = list_models(root).unwrap();
        assert_eq!(models.len(), 2);
        let find = |id: &str| models.iter().find(|m| m.id == id).unwrap();

        let big = find("big");
        assert_eq!(big.name, "Big");
        assert_eq!(big.shards.len(), 2);
        assert!(big.file_size > 11);

        let tiny = find("tiny-model");
        assert_eq!(tiny.name, "Tiny Llama");
        assert_eq!(tiny.shards, vec![tiny.path.clone()]);
    }

    #[test]
    fn deeply_nested_arrays_are_rejected() {
        let bytes = Builder::new()
            .string("general.name", "Evil")
            .nested_array("general.tags", 200_000)
            .bytes();
        let mut r = Cursor::new(bytes);
        probe_reader(&mut r).unwrap();
        read_kv(&mut r).unwrap();
        assert!(matches!(read_kv(&mut r), Err(GGUFError::NestedArray)));
    }

    #[test]
    fn list_models_skips_nested_array_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        tiny_llama().write(&root.join("good.gguf"));
        Builder::new()
            .string("general.name", "Evil")
            .nested_array("general.tags", 200_000)
            .write(&root.join("evil.gguf"));
        Builder::new()
            .nested_array("general.tags", 2)
            .write(&root.join("shallow.gguf"));

        let models = list_models(root).unwrap();
        let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["good"]);
    }

    #[test]
    fn flat_arrays_still_parse() {
        let bytes = Builder::new().nested_array("general.tags", 1).bytes();
        let mut r = Cursor::new(bytes);
        probe_reader(&mut r).unwrap();
        let kv = read_kv(&mut r).unwrap();
        assert_eq!(kv.value, GGUFValue::Array(vec![GGUFValue::Uint8(7)]));
    }

    #[cfg(unix)]
    #[test]
    fn list_models_ignores_symlinked_directory_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        tiny_llama().write(&root.join("sub/tiny.gguf"));
        std::os::unix::fs::symlink(root, root.join("sub/loop")).unwrap();

        let models = list_models(root).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "tiny");
    }

    #[test]
    fn list_models_on_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_models(&dir.path().join("nope")).unwrap().is_empty());
    }
}
