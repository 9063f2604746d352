//! GGUF header inspection
//!
//! Validates the magic, reads the version and counts, and works out the
//! declared architecture so callers can pick a model type before loading.

use bytes::Buf;
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

pub const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// Bytes of the file read for header parsing.
const HEADER_WINDOW: u64 = 64 * 1024;
/// Bytes scanned for architecture names when the metadata key is missing.
const SCAN_WINDOW: usize = 8 * 1024;

const KNOWN_ARCHITECTURES: &[&str] = &[
    "llama", "falcon", "mpt", "gpt2", "gptj", "gpt_neox", "phi", "rwkv", "exaone",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GgufAnalysis {
    pub file_size_mb: f64,
    pub gguf_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tensor_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_architecture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

pub struct FormatDetector;

impl FormatDetector {
    pub fn has_gguf_magic(path: &Path) -> std::io::Result<bool> {
        let mut magic = [0u8; 4];
        let mut file = File::open(path)?;
        match file.read_exact(&mut magic) {
            Ok(()) => Ok(&magic == GGUF_MAGIC),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Reads the GGUF header of `path`. Errors are client-facing messages.
    pub fn analyze(path: &Path) -> Result<GgufAnalysis, String> {
        if !path.exists() {
            return Err("File not found".to_string());
        }

        let read_header = || -> std::io::Result<(u64, Vec<u8>)> {
            let file = File::open(path)?;
            let size = file.metadata()?.len();
            let mut head = Vec::new();
            file.take(HEADER_WINDOW).read_to_end(&mut head)?;
            Ok((size, head))
        };
        let (size, head) =
            read_header().map_err(|e| format!("Error analyzing GGUF file: {}", e))?;

        if head.len() < 8 || &head[..4] != GGUF_MAGIC {
            return Err("Not a valid GGUF file (missing GGUF magic)".to_string());
        }

        let mut reader = HeaderReader::new(&head[4..]);
        let version = reader.u32().unwrap_or_default();
        reader.wide = version >= 2;

        let tensor_count = reader.len();
        let metadata_count = reader.len();
        let mut detected_architecture = metadata_count.and_then(|kv| reader.find_architecture(kv));
        if detected_architecture.is_none() {
            detected_architecture = scan_for_architecture(&head);
        }

        debug!(
            "GGUF v{} at {}: tensors={:?} kv={:?} arch={:?}",
            version,
            path.display(),
            tensor_count,
            metadata_count,
            detected_architecture
        );

        Ok(GgufAnalysis {
            file_size_mb: size as f64 / (1024.0 * 1024.0),
            gguf_version: version,
            tensor_count,
            metadata_count,
            detected_architecture,
            recommendation: None,
        })
    }

    /// `analyze` plus a model type suggestion for the detected architecture.
    pub fn analyze_with_recommendation(path: &Path) -> Result<GgufAnalysis, String> {
        let mut analysis = Self::analyze(path)?;
        analysis.recommendation = analysis.detected_architecture.as_deref().map(Self::recommend);
        Ok(analysis)
    }

    pub fn recommend(arch: &str) -> String {
        match Self::model_type_for_architecture(arch) {
            Some(model_type) => format!("Use model_type: {}", model_type),
            None => format!(
                "Architecture '{}' detected, but might not be compatible with available model types",
                arch
            ),
        }
    }

    pub fn model_type_for_architecture(arch: &str) -> Option<&'static str> {
        match arch {
            "llama" => Some("llama"),
            "phi" | "phi2" => Some("phi2"),
            "rwkv" => Some("rwkv"),
            _ => None,
        }
    }
}

fn scan_for_architecture(head: &[u8]) -> Option<String> {
    let window = &head[..head.len().min(SCAN_WINDOW)];
    let sample = String::from_utf8_lossy(window).to_lowercase();
    KNOWN_ARCHITECTURES
        .iter()
        .find(|arch| sample.contains(*arch))
        .map(|arch| arch.to_string())
}

/// Cursor over a GGUF header. Version 1 files use 32-bit lengths, later
/// versions 64-bit.
struct HeaderReader<'a> {
    buf: &'a [u8],
    wide: bool,
}

impl<'a> HeaderReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, wide: true }
    }

    fn u32(&mut self) -> Option<u32> {
        (self.buf.remaining() >= 4).then(|| self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Option<u64> {
        (self.buf.remaining() >= 8).then(|| self.buf.get_u64_le())
    }

    fn len(&mut self) -> Option<u64> {
        if self.wide {
            self.u64()
        } else {
            self.u32().map(u64::from)
        }
    }

    fn skip(&mut self, n: u64) -> Option<()> {
        let n = usize::try_from(n).ok()?;
        if self.buf.remaining() < n {
            return None;
        }
        self.buf.advance(n);
        Some(())
    }

    fn string(&mut self) -> Option<String> {
        let len = usize::try_from(self.len()?).ok()?;
        if self.buf.remaining() < len {
            return None;
        }
        let s = String::from_utf8_lossy(&self.buf[..len]).into_owned();
        self.buf.advance(len);
        Some(s)
    }

    fn skip_value(&mut self, vtype: u32) -> Option<()> {
        match vtype {
            0 | 1 | 7 => self.skip(1),
            2 | 3 => self.skip(2),
            4 | 5 | 6 => self.skip(4),
            10 | 11 | 12 => self.skip(8),
            8 => self.string().map(|_| ()),
            9 => {
                let elem_type = self.u32()?;
                let count = self.len()?;
                for _ in 0..count {
                    self.skip_value(elem_type)?;
                }
                Some(())
            }
            _ => None,
        }
    }

    /// Walks up to `kv_count` pairs looking for `general.architecture`.
    /// Stops quietly when the header runs past the read window.
    fn find_architecture(&mut self, kv_count: u64) -> Option<String> {
        for _ in 0..kv_count {
            let key = self.string()?;
            let vtype = self.u32()?;
            if key == "general.architecture" && vtype == 8 {
                return self.string().map(|arch| arch.to_lowercase());
            }
            self.skip_value(vtype)?;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_string(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    /// Minimal v3 header: a u32 KV, a string array, then the architecture.
    fn build_synthetic_gguf(arch: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"GGUF");
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&7u64.to_le_bytes());
        buf.extend_from_slice(&3u64.to_le_bytes());

        write_string(&mut buf, "general.quantization_version");
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(&2u32.to_le_bytes());

        write_string(&mut buf, "tokenizer.ggml.tokens");
        buf.extend_from_slice(&9u32.to_le_bytes());
        buf.extend_from_slice(&8u32.to_le_bytes());
        buf.extend_from_slice(&2u64.to_le_bytes());
        write_string(&mut buf, "<s>");
        write_string(&mut buf, "</s>");

        write_string(&mut buf, "general.architecture");
        buf.extend_from_slice(&8u32.to_le_bytes());
        write_string(&mut buf, arch);
        buf
    }

    fn write_temp(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn test_analyze_reads_metadata_architecture() {
        let (_dir, path) = write_temp(&build_synthetic_gguf("phi2"));

        let analysis = FormatDetector::analyze(&path).unwrap();
        assert_eq!(analysis.gguf_version, 3);
        assert_eq!(analysis.tensor_count, Some(7));
        assert_eq!(analysis.metadata_count, Some(3));
        assert_eq!(analysis.detected_architecture.as_deref(), Some("phi2"));
        assert!(analysis.file_size_mb > 0.0);
    }

    #[test]
    fn test_recommendation_for_phi_architecture() {
        let (_dir, path) = write_temp(&build_synthetic_gguf("phi2"));

        let analysis = FormatDetector::analyze_with_recommendation(&path).unwrap();
        assert_eq!(analysis.recommendation.as_deref(), Some("Use model_type: phi2"));
    }

    #[test]
    fn test_falls_back_to_name_scan() {
        let mut bytes = b"GGUF".to_vec();
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(b"garbage that mentions rwkv somewhere");
        let (_dir, path) = write_temp(&bytes);

        let analysis = FormatDetector::analyze(&path).unwrap();
        assert_eq!(analysis.detected_architecture.as_deref(), Some("rwkv"));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let (_dir, path) = write_temp(b"NOT_GGUF_DATA");

        assert_eq!(
            FormatDetector::analyze(&path).unwrap_err(),
            "Not a valid GGUF file (missing GGUF magic)"
        );
        assert!(!FormatDetector::has_gguf_magic(&path).unwrap());
    }

    #[test]
    fn test_short_file_has_no_magic() {
        let (_dir, path) = write_temp(b"GG");
        assert!(!FormatDetector::has_gguf_magic(&path).unwrap());
    }

    #[test]
    fn test_missing_file() {
        let err = FormatDetector::analyze(Path::new("/definitely/not/here.gguf")).unwrap_err();
        assert_eq!(err, "File not found");
    }

    #[test]
    fn test_unknown_architecture_recommendation() {
        assert_eq!(FormatDetector::recommend("llama"), "Use model_type: llama");
        assert!(FormatDetector::recommend("falcon").contains("might not be compatible"));
    }
}
