use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Length of a virtio-fs mount tag. The hypervisor rejects longer device tags.
pub const MOUNT_TAG_LEN: usize = 36;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MountError {
    #[error("invalid volume '{volume}': expected SOURCE:TARGET[:ro|:rw]")]
    Format { volume: String },

    #[error("invalid volume '{volume}': path '{path}' must be absolute")]
    RelativePath { volume: String, path: PathBuf },

    #[error("invalid volume '{volume}': unknown option '{option}'")]
    Option { volume: String, option: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountType {
    VirtioFs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountSpec {
    pub original_input: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub tag: String,
    pub read_only: bool,
    #[serde(rename = "Type")]
    pub mount_type: MountType,
}

/// Derive the device tag for a guest mount point.
pub fn mount_tag(target: &Path) -> String {
    let digest = Sha256::digest(target.as_os_str().as_bytes());
    let mut tag = hex::encode(digest);
    tag.truncate(MOUNT_TAG_LEN);
    tag
}

impl MountSpec {
    /// Parse `SOURCE[:TARGET][:ro|:rw]`. A lone source is mounted at the same path.
    pub fn parse(volume: &str) -> Result<Self, MountError> {
        let parts: Vec<&str> = volume.split(':').collect();
        let (source, target, option) = match parts.as_slice() {
            [source] => (*source, *source, None),
            [source, target] => (*source, *target, None),
            [source, target, option] => (*source, *target, Some(*option)),
            _ => {
                return Err(MountError::Format {
                    volume: volume.to_string(),
                });
            }
        };
        if source.is_empty() || target.is_empty() {
            return Err(MountError::Format {
                volume: volume.to_string(),
            });
        }

        let read_only = match option {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(other) => {
                return Err(MountError::Option {
                    volume: volume.to_string(),
                    option: other.to_string(),
                });
            }
        };

        let source = PathBuf::from(source);
        let target = PathBuf::from(target);
        for path in [&source, &target] {
            if !path.is_absolute() {
                return Err(MountError::RelativePath {
                    volume: volume.to_string(),
                    path: path.clone(),
                });
            }
        }

        Ok(Self {
            original_input: volume.to_string(),
            tag: mount_tag(&target),
            source,
            target,
            read_only,
            mount_type: MountType::VirtioFs,
        })
    }

    /// Whether this mount's target is, contains, or lies under `path`.
    pub fn overlaps(&self, path: &Path) -> bool {
        self.target.starts_with(path) || path.starts_with(&self.target)
    }
}

pub fn parse_volumes<S: AsRef<str>>(volumes: &[S]) -> Result<Vec<MountSpec>, MountError> {
    volumes
        .iter()
        .map(|volume| MountSpec::parse(volume.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_is_a_pure_function_of_target() {
        let a = MountSpec::parse("/Users/me/src:/src").unwrap();
        let b = MountSpec::parse("/Volumes/other:/src:ro").unwrap();
        let c = MountSpec::parse("/Users/me/src:/code").unwrap();

        assert_eq!(a.tag, b.tag);
        assert_ne!(a.tag, c.tag);
        assert_eq!(a.tag.len(), MOUNT_TAG_LEN);
        assert_eq!(a.tag, mount_tag(Path::new("/src")));
    }

    #[test]
    fn test_tags_of_many_targets_are_distinct() {
        let tags: std::collections::HashSet<String> = (0..1000)
            .map(|i| mount_tag(Path::new(&format!("/mnt/volume-{i}"))))
            .collect();
        assert_eq!(tags.len(), 1000);
    }

    #[test]
    fn test_parse_options() {
        let spec = MountSpec::parse("/a:/b:ro").unwrap();
        assert!(spec.read_only);
        assert_eq!(spec.source, Path::new("/a"));
        assert_eq!(spec.target, Path::new("/b"));

        let spec = MountSpec::parse("/a").unwrap();
        assert!(!spec.read_only);
        assert_eq!(spec.target, Path::new("/a"));
    }

    #[test]
    fn test_parse_rejects_bad_volumes() {
        assert!(matches!(
            MountSpec::parse("relative:/b"),
            Err(MountError::RelativePath { .. })
        ));
        assert!(matches!(
            MountSpec::parse("/a:/b:rx"),
            Err(MountError::Option { .. })
        ));
        assert!(matches!(
            MountSpec::parse("/a:/b:ro:extra"),
            Err(MountError::Format { .. })
        ));
    }

    #[test]
    fn test_overlaps() {
        let spec = MountSpec::parse("/a:/mnt").unwrap();
        assert!(spec.overlaps(Path::new("/mnt/.cradle-ignition")));
        assert!(spec.overlaps(Path::new("/mnt")));
        assert!(spec.overlaps(Path::new("/")));
        assert!(!spec.overlaps(Path::new("/mnt2")));
    }
}
