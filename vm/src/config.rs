use chrono::{DateTime, Utc};
use cradle_fs::{self as fs, FsError};
use cradle_system::{CpuCount, MemorySize};
use dir_lock::DirLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::mount::MountSpec;
use crate::paths::Workspace;
use crate::provider::Provider;

const CONFIG_EXTENSION: &str = "json";
const LOCK_EXTENSION: &str = "lock";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no machine named '{name}'")]
    NotFound { name: String },

    #[error("invalid machine name '{name}': must match ^[A-Za-z0-9][A-Za-z0-9_.-]*$")]
    InvalidName { name: String },

    #[error("machine config '{name}' has no file path to write to")]
    NoPath { name: String },

    #[error("failed to parse machine config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize machine config '{name}': {source}")]
    Serialize {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to lock machine config '{path}': {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: dir_lock::Error,
    },

    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Whether `name` is usable as a machine name: `^[A-Za-z0-9][A-Za-z0-9_.-]*$`.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

pub fn validate_name(name: &str) -> Result<(), ConfigError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidName {
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resources {
    #[serde(rename = "CPUs")]
    pub cpus: CpuCount,
    /// Guest memory in MiB.
    pub memory: MemorySize,
    #[serde(rename = "DiskSizeGiB")]
    pub disk_size_gib: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Disk {
    pub path: PathBuf,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SshConfig {
    pub identity_path: PathBuf,
    pub port: u16,
    pub remote_username: String,
}

/// A host unix socket forwarded to a socket inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ForwardSocket {
    pub host: PathBuf,
    pub guest: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkConfig {
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    /// Datagram socket the hypervisor's virtio-net device talks to.
    pub transport_socket: PathBuf,
    pub forwards: Vec<ForwardSocket>,
}

/// Provider-specific settings, filled in by the provider when the VM is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HypervisorConfig {
    pub rest_socket: Option<PathBuf>,
    pub efi_store: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MachineDirs {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub sock_dir: PathBuf,
    pub logs_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Processes {
    pub network_pid: Option<u32>,
    pub hypervisor_pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IgnitionConfig {
    /// Host directory shared with the guest, holding the script.
    pub dir: PathBuf,
    pub script: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MachineConfig {
    pub name: String,
    pub provider: Provider,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub last_up: Option<DateTime<Utc>>,
    pub resources: Resources,
    pub bootable: Disk,
    pub data_disk: Disk,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(rename = "SSH")]
    pub ssh: SshConfig,
    pub network: NetworkConfig,
    pub ignition: IgnitionConfig,
    #[serde(default)]
    pub hypervisor: HypervisorConfig,
    pub dirs: MachineDirs,
    #[serde(default)]
    pub processes: Processes,

    #[serde(skip)]
    path: Option<PathBuf>,
}

/// Everything needed to build a fresh [`MachineConfig`].
#[derive(Debug, Clone)]
pub struct NewMachine {
    pub name: String,
    pub resources: Resources,
    pub boot_version: String,
    pub data_version: String,
    pub mounts: Vec<MountSpec>,
    pub ssh_identity: PathBuf,
    pub ssh_port: u16,
    pub ssh_user: String,
}

/// Guest path of the forwarded container API socket.
pub const GUEST_API_SOCKET: &str = "/run/podman/podman.sock";

impl MachineConfig {
    /// Lay out a new machine below the workspace. Nothing is written.
    pub fn new(workspace: &Workspace, provider: Provider, machine: NewMachine) -> Self {
        let NewMachine {
            name,
            resources,
            boot_version,
            data_version,
            mounts,
            ssh_identity,
            ssh_port,
            ssh_user,
        } = machine;

        let config_dir = workspace.config_dir(provider);
        let data_dir = workspace.machine_data_dir(provider, &name);
        let sock_dir = workspace.sock_dir();
        let logs_dir = workspace.logs_dir();
        let ignition_dir = data_dir.join("ignition");

        Self {
            path: Some(config_dir.join(format!("{name}.{CONFIG_EXTENSION}"))),
            provider,
            created: Utc::now(),
            last_up: None,
            resources,
            bootable: Disk {
                path: data_dir.join(format!("{name}-{}.raw", provider.name())),
                version: boot_version,
            },
            data_disk: Disk {
                path: data_dir.join(format!("{name}-data.raw")),
                version: data_version,
            },
            mounts,
            ssh: SshConfig {
                identity_path: ssh_identity,
                port: ssh_port,
                remote_username: ssh_user,
            },
            network: NetworkConfig {
                pid_file: sock_dir.join(format!("{name}-gvproxy.pid")),
                log_file: logs_dir.join(format!("{name}-gvproxy.log")),
                transport_socket: sock_dir.join(format!("{name}-gvproxy.sock")),
                forwards: vec![ForwardSocket {
                    host: sock_dir.join(format!("{name}-podman.sock")),
                    guest: PathBuf::from(GUEST_API_SOCKET),
                }],
            },
            ignition: IgnitionConfig {
                script: ignition_dir.join("ignition.sh"),
                dir: ignition_dir,
            },
            hypervisor: HypervisorConfig::default(),
            dirs: MachineDirs {
                config_dir,
                data_dir,
                sock_dir,
                logs_dir,
            },
            processes: Processes::default(),
            name,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Socket the control API listens on.
    pub fn api_socket(&self) -> PathBuf {
        self.dirs.sock_dir.join(format!("{}-api.sock", self.name))
    }

    /// Host end of the first forwarded guest socket, if any.
    pub fn forwarded_api_socket(&self) -> Option<&Path> {
        self.network.forwards.first().map(|forward| forward.host.as_path())
    }

    /// Serialize and atomically replace the config file.
    #[tracing::instrument(skip(self), fields(name = %self.name))]
    pub async fn write(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or_else(|| ConfigError::NoPath {
            name: self.name.clone(),
        })?;
        let json = serde_json::to_vec_pretty(self).map_err(|source| ConfigError::Serialize {
            name: self.name.clone(),
            source,
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir(parent).await?;
        }
        fs::write_file_atomic(path, &json).await?;
        debug!(path = %path.display(), "Wrote machine config");
        Ok(())
    }
}

/// The machine configs of one provider, one JSON file per machine.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    config_dir: PathBuf,
}

impl ConfigStore {
    /// Open the store, creating the workspace directories on first use.
    pub async fn open(workspace: &Workspace, provider: Provider) -> Result<Self, ConfigError> {
        workspace.ensure(provider).await?;
        Ok(Self::new(workspace.config_dir(provider)))
    }

    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{name}.{CONFIG_EXTENSION}"))
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{name}.{LOCK_EXTENSION}"))
    }

    /// Take the per-machine advisory lock. Released on drop.
    pub async fn lock(&self, name: &str) -> Result<DirLock, ConfigError> {
        validate_name(name)?;
        let path = self.lock_path(name);
        DirLock::new(&path)
            .await
            .map_err(|source| ConfigError::Lock { path, source })
    }

    #[tracing::instrument(skip(self))]
    pub async fn load(&self, name: &str) -> Result<MachineConfig, ConfigError> {
        validate_name(name)?;
        let path = self.config_path(name);
        if !fs::path_exists(&path).await? {
            return Err(ConfigError::NotFound {
                name: name.to_string(),
            });
        }
        Self::load_path(&path).await
    }

    async fn load_path(path: &Path) -> Result<MachineConfig, ConfigError> {
        let json = fs::read_file_to_string(path).await?;
        let mut config: MachineConfig =
            serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Load every machine config, skipping entries that fail to load.
    #[tracing::instrument(skip(self))]
    pub async fn list_all(&self) -> Result<BTreeMap<String, MachineConfig>, ConfigError> {
        let mut configs = BTreeMap::new();
        if !fs::path_exists(&self.config_dir).await? {
            return Ok(configs);
        }

        for path in fs::read_dir(&self.config_dir).await? {
            if path.extension().and_then(|ext| ext.to_str()) != Some(CONFIG_EXTENSION) {
                continue;
            }
            match Self::load_path(&path).await {
                Ok(config) => {
                    configs.insert(config.name.clone(), config);
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "Skipping unreadable machine config");
                }
            }
        }
        Ok(configs)
    }
}
