use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Cannot create directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot read directory '{path}': {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot iterate directory '{path}': {source}")]
    ReadDirEntry {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot read directory metadata '{path}': {source}")]
    Metadata {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write directory '{path}' (read-only)")]
    ReadOnlyDir { path: PathBuf },

    #[error("Cannot create file '{path}': {source}")]
    CreateFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot determine if path exists '{path}': {source}")]
    PathExists {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot read link '{path}': {source}")]
    ReadLink {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot rename file from '{from}' to '{to}': {source}")]
    RenameFile {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot delete file '{path}': {source}")]
    RemoveFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot copy file from '{from}' to '{to}': {source}")]
    CopyFile {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot set size of '{path}' to {size} bytes: {source}")]
    SetLen {
        path: PathBuf,
        size: u64,
        source: std::io::Error,
    },

    #[error("Cannot set mode of '{path}' to {mode:o}: {source}")]
    SetMode {
        path: PathBuf,
        mode: u32,
        source: std::io::Error,
    },
}

pub async fn create_dir<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::create_dir_all(p)
        .await
        .map_err(|source| FsError::CreateDir {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn read_dir<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>, FsError> {
    let p = path.as_ref();
    let mut dir = fs::read_dir(p).await.map_err(|source| FsError::ReadDir {
        path: p.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|source| FsError::ReadDirEntry {
            path: p.to_path_buf(),
            source,
        })?
    {
        entries.push(entry.path());
    }
    Ok(entries)
}

pub async fn setup_directory_access<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    create_dir(p).await?;

    let permission = fs::metadata(p)
        .await
        .map_err(|source| FsError::Metadata {
            path: p.to_path_buf(),
            source,
        })?
        .permissions();

    if permission.readonly() {
        return Err(FsError::ReadOnlyDir {
            path: p.to_path_buf(),
        });
    }

    Ok(())
}

pub async fn create_file<P: AsRef<Path>>(path: P) -> Result<tokio::fs::File, FsError> {
    let p = path.as_ref();
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(p)
        .await
        .map_err(|source| FsError::CreateFile {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn path_exists<P: AsRef<Path>>(path: P) -> Result<bool, FsError> {
    let p = path.as_ref();
    fs::try_exists(p)
        .await
        .map_err(|source| FsError::PathExists {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn write_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), FsError> {
    let p = path.as_ref();
    let mut file = create_file(p).await?;
    file.write_all(data)
        .await
        .map_err(|source| FsError::WriteFile {
            path: p.to_path_buf(),
            source,
        })?;
    file.flush().await.map_err(|source| FsError::WriteFile {
        path: p.to_path_buf(),
        source,
    })
}

/// Path of the scratch file used while replacing `path`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut temp: OsString = path.as_os_str().to_owned();
    temp.push(".tmp");
    PathBuf::from(temp)
}

/// Replace `path` with `data` so that readers only ever see the old or the new contents.
///
/// The data is written and synced to a sibling temp file which is then renamed over the
/// target. A crash mid-write leaves at most a stale `.tmp` sibling behind.
pub async fn write_file_atomic<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), FsError> {
    let p = path.as_ref();
    let temp = temp_path_for(p);

    let mut file = create_file(&temp).await?;
    let write_error = |source| FsError::WriteFile {
        path: temp.clone(),
        source,
    };
    file.write_all(data).await.map_err(write_error)?;
    file.flush().await.map_err(write_error)?;
    file.sync_all().await.map_err(write_error)?;
    drop(file);

    rename_file(&temp, p).await?;
    debug!(path = %p.display(), bytes = data.len(), "Replaced file");
    Ok(())
}

pub async fn read_file_to_string<P: AsRef<Path>>(path: P) -> Result<String, FsError> {
    let p = path.as_ref();
    fs::read_to_string(p)
        .await
        .map_err(|source| FsError::ReadFile {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn read_link<P: AsRef<Path>>(path: P) -> Result<PathBuf, FsError> {
    let p = path.as_ref();
    fs::read_link(p).await.map_err(|source| FsError::ReadLink {
        path: p.to_path_buf(),
        source,
    })
}

pub async fn rename_file<F: AsRef<Path>, T: AsRef<Path>>(from: F, to: T) -> Result<(), FsError> {
    let from_p = from.as_ref();
    let to_p = to.as_ref();
    fs::rename(from_p, to_p)
        .await
        .map_err(|source| FsError::RenameFile {
            from: from_p.to_path_buf(),
            to: to_p.to_path_buf(),
            source,
        })
}

pub async fn copy_file<F: AsRef<Path>, T: AsRef<Path>>(from: F, to: T) -> Result<u64, FsError> {
    let from_p = from.as_ref();
    let to_p = to.as_ref();
    fs::copy(from_p, to_p)
        .await
        .map_err(|source| FsError::CopyFile {
            from: from_p.to_path_buf(),
            to: to_p.to_path_buf(),
            source,
        })
}

pub async fn remove_file<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::remove_file(p)
        .await
        .map_err(|source| FsError::RemoveFile {
            path: p.to_path_buf(),
            source,
        })
}

/// Remove a file, treating an already-missing file as success.
pub async fn remove_file_if_exists<P: AsRef<Path>>(path: P) -> Result<bool, FsError> {
    let p = path.as_ref();
    match fs::remove_file(p).await {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(FsError::RemoveFile {
            path: p.to_path_buf(),
            source,
        }),
    }
}

/// Create (or truncate) a sparse file of exactly `size` bytes.
pub async fn create_sparse_file<P: AsRef<Path>>(path: P, size: u64) -> Result<(), FsError> {
    let p = path.as_ref();
    let file = create_file(p).await?;
    file.set_len(size).await.map_err(|source| FsError::SetLen {
        path: p.to_path_buf(),
        size,
        source,
    })
}

pub async fn set_file_mode<P: AsRef<Path>>(path: P, mode: u32) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::set_permissions(p, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|source| FsError::SetMode {
            path: p.to_path_buf(),
            mode,
            source,
        })
}
