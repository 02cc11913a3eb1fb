use cradle_fs::{self as fs, FsError};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::provider::Provider;

/// The directory set every VM lives under.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self, provider: Provider) -> PathBuf {
        self.root.join("config").join(provider.name())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn provider_data_dir(&self, provider: Provider) -> PathBuf {
        self.data_dir().join(provider.name())
    }

    pub fn machine_data_dir(&self, provider: Provider, name: &str) -> PathBuf {
        self.provider_data_dir(provider).join(name)
    }

    // Unix socket paths are limited to ~104 bytes on macOS, so sockets live in a short, flat dir.
    pub fn sock_dir(&self) -> PathBuf {
        self.root.join("sock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn port_alloc_file(&self) -> PathBuf {
        self.data_dir().join("port-alloc.json")
    }

    pub fn port_alloc_lock(&self) -> PathBuf {
        self.data_dir().join("port-alloc.lock")
    }

    /// Create the config, data, socket and log directories if absent.
    pub async fn ensure(&self, provider: Provider) -> Result<(), FsError> {
        for dir in [
            self.config_dir(provider),
            self.provider_data_dir(provider),
            self.sock_dir(),
            self.logs_dir(),
        ] {
            fs::setup_directory_access(&dir).await?;
        }
        debug!(root = %self.root.display(), "Workspace directories ready");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExecutablePaths {
    pub gvproxy: PathBuf,
    pub vfkit: PathBuf,
    pub krunkit: PathBuf,
    pub zstd: PathBuf,
    pub xz: PathBuf,
}

impl ExecutablePaths {
    /// Resolve helper executables: an env var override, else the first match on `PATH`.
    ///
    /// An executable that cannot be found keeps its bare name, so the failure surfaces
    /// as a spawn error naming the program only when it is actually needed.
    pub fn from_env() -> Self {
        Self {
            gvproxy: find("CRADLE_GVPROXY", "gvproxy"),
            vfkit: find("CRADLE_VFKIT", "vfkit"),
            krunkit: find("CRADLE_KRUNKIT", "krunkit"),
            zstd: find("CRADLE_ZSTD", "zstd"),
            xz: find("CRADLE_XZ", "xz"),
        }
    }

    pub fn hypervisor(&self, provider: Provider) -> &Path {
        match provider {
            Provider::Vfkit => &self.vfkit,
            Provider::Krunkit => &self.krunkit,
        }
    }
}

fn find(var: &str, name: &str) -> PathBuf {
    if let Some(path) = std::env::var_os(var).filter(|value| !value.is_empty()) {
        return PathBuf::from(path);
    }
    match which::which(name) {
        Ok(path) => path,
        Err(error) => {
            debug!(executable = name, %error, "Executable not found on PATH");
            PathBuf::from(name)
        }
    }
}
