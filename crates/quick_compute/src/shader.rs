//! Pre-compiled shader bytecode loaded from disk.

use std::path::{Path, PathBuf};

/// Raw shader bytes as read from a file. The device decides how to interpret
/// them; an empty blob is never a valid shader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderBytecode {
    bytes: Vec<u8>,
    path: Option<PathBuf>,
}

impl ShaderBytecode {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            path: None,
        }
    }

    /// Reads `path`. A missing or unreadable file is logged and yields an
    /// empty shader, which later fails pipeline creation.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read(path) {
            Ok(bytes) => {
                log::debug!("loaded shader {} ({} bytes)", path.display(), bytes.len());
                Self {
                    bytes,
                    path: Some(path.to_path_buf()),
                }
            }
            Err(e) => {
                log::warn!("Cannot open shader file {}: {e}", path.display());
                Self {
                    bytes: Vec::new(),
                    path: Some(path.to_path_buf()),
                }
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_invalid_shader() {
        let shader = ShaderBytecode::load("/definitely/not/here.spv");
        assert!(!shader.is_valid());
        assert_eq!(shader.path(), Some(Path::new("/definitely/not/here.spv")));
    }

    #[test]
    fn reads_raw_bytes() {
        let path = std::env::temp_dir().join(format!("qc-shader-{}.bin", std::process::id()));
        std::fs::write(&path, [3u8, 2, 35, 7]).unwrap();
        let shader = ShaderBytecode::load(&path);
        std::fs::remove_file(&path).ok();

        assert!(shader.is_valid());
        assert_eq!(shader.bytes(), &[3, 2, 35, 7]);
    }
}
