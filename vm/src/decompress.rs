use async_trait::async_trait;
use cradle_cmd::{Command, CommandError};
use cradle_fs::{self as fs, FsError};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum DecompressError {
    #[error("failed to decompress '{source_path}'")]
    Command {
        source_path: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Turns a (possibly compressed) disk image into a raw disk at `target`.
#[async_trait]
pub trait Decompress: Send + Sync + Debug {
    async fn decompress(&self, source: &Path, target: &Path) -> Result<(), DecompressError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zstd,
    Xz,
    None,
}

impl Compression {
    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("zst") => Compression::Zstd,
            Some("xz") => Compression::Xz,
            _ => Compression::None,
        }
    }
}

/// [`Decompress`] by running the `zstd` and `xz` executables.
#[derive(Debug, Clone)]
pub struct CommandDecompressor {
    pub zstd: PathBuf,
    pub xz: PathBuf,
}

impl CommandDecompressor {
    pub fn new(zstd: impl Into<PathBuf>, xz: impl Into<PathBuf>) -> Self {
        Self {
            zstd: zstd.into(),
            xz: xz.into(),
        }
    }

    async fn decompress_to(&self, source: &Path, temp: &Path) -> Result<(), DecompressError> {
        let failed = |error| DecompressError::Command {
            source_path: source.to_path_buf(),
            source: error,
        };
        match Compression::detect(source) {
            Compression::Zstd => {
                Command::new(&self.zstd)
                    .args(["-d", "-f", "-q"])
                    .arg(source)
                    .arg("-o")
                    .arg(temp)
                    .run()
                    .await
                    .map_err(failed)?;
            }
            Compression::Xz => {
                Command::new(&self.xz)
                    .arg("-dc")
                    .arg(source)
                    .run_with_stdout_to(temp)
                    .await
                    .map_err(failed)?;
            }
            Compression::None => {
                fs::copy_file(source, temp).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Decompress for CommandDecompressor {
    #[tracing::instrument(skip(self))]
    async fn decompress(&self, source: &Path, target: &Path) -> Result<(), DecompressError> {
        let temp = fs::temp_path_for(target);
        if let Some(parent) = target.parent() {
            fs::create_dir(parent).await?;
        }

        if let Err(error) = self.decompress_to(source, &temp).await {
            if let Err(cleanup) = fs::remove_file_if_exists(&temp).await {
                warn!(path = %temp.display(), error = %cleanup, "Failed to remove partial image");
            }
            return Err(error);
        }

        fs::rename_file(&temp, target).await?;
        info!(target_path = %target.display(), "Disk image ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_by_extension() {
        assert_eq!(Compression::detect(Path::new("fedora.raw.zst")), Compression::Zstd);
        assert_eq!(Compression::detect(Path::new("fedora.raw.xz")), Compression::Xz);
        assert_eq!(Compression::detect(Path::new("fedora.raw")), Compression::None);
    }

    #[tokio::test]
    async fn test_uncompressed_image_is_copied_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("image.raw");
        let target = dir.path().join("machine").join("boot.raw");
        std::fs::write(&source, b"boot sector").unwrap();

        CommandDecompressor::new("zstd", "xz")
            .decompress(&source, &target)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"boot sector");
        assert!(!fs::temp_path_for(&target).exists());
    }

    #[tokio::test]
    async fn test_failed_decompression_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("image.raw.xz");
        let target = dir.path().join("boot.raw");
        std::fs::write(&source, b"not xz").unwrap();

        let result = CommandDecompressor::new("zstd", "/bin/false")
            .decompress(&source, &target)
            .await;

        assert!(matches!(result, Err(DecompressError::Command { .. })));
        assert!(!target.exists());
        assert!(!fs::temp_path_for(&target).exists());
    }
}
