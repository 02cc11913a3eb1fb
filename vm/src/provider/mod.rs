mod command;
mod krunkit;
mod vfkit;

pub use self::command::{GUEST_MAC, HypervisorCommand};

use cradle_system::{Arch, Os};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::MachineConfig;
use crate::context::Context;
use crate::decompress::DecompressError;
use crate::http::{self, HttpError};
use crate::network::GvproxyCommand;
use crate::process::{ProcessError, ProcessHandle};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("no supported hypervisor for {arch} on {os}")]
    Unsupported { arch: Arch, os: Os },

    #[error("unknown provider '{value}' (expected vfkit or krunkit)")]
    Unknown { value: String },

    #[error("provider {provider} is not available on {arch}")]
    UnsupportedArch { provider: Provider, arch: Arch },

    #[error("machine '{name}' has no {what} configured for {provider}")]
    NotConfigured {
        name: String,
        provider: Provider,
        what: &'static str,
    },

    #[error("failed to extract boot image '{source_path}'")]
    ExtractBootable {
        source_path: std::path::PathBuf,
        #[source]
        source: DecompressError,
    },

    #[error("failed to start {what}")]
    Spawn {
        what: &'static str,
        #[source]
        source: ProcessError,
    },
}

/// The hypervisor that runs the VM. Picked once per process by [`Provider::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Vfkit,
    Krunkit,
}

/// Lifecycle state reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Starting,
    Running,
    Stopped,
    Error,
}

impl Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Starting => write!(f, "starting"),
            VmState::Running => write!(f, "running"),
            VmState::Stopped => write!(f, "stopped"),
            VmState::Error => write!(f, "error"),
        }
    }
}

impl VmState {
    /// Map a `VirtualMachineState*` name from the REST API.
    pub fn from_rest(state: &str) -> Self {
        if state.contains("Running") {
            VmState::Running
        } else if state.contains("Starting") {
            VmState::Starting
        } else if state.contains("Stopped") || state.contains("Stopping") {
            VmState::Stopped
        } else {
            VmState::Error
        }
    }
}

#[derive(Debug, Deserialize)]
struct RestState {
    state: String,
}

impl Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Provider {
    type Err = ProviderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vfkit" | "applehv" => Ok(Provider::Vfkit),
            "krunkit" | "libkrun" => Ok(Provider::Krunkit),
            _ => Err(ProviderError::Unknown {
                value: value.to_string(),
            }),
        }
    }
}

impl Provider {
    /// Environment variable that overrides provider selection.
    pub const OVERRIDE_VAR: &'static str = "CRADLE_PROVIDER";

    pub fn name(self) -> &'static str {
        match self {
            Provider::Vfkit => "vfkit",
            Provider::Krunkit => "krunkit",
        }
    }

    /// Choose the hypervisor for this host. An override wins when the host can run it.
    pub fn select(arch: Arch, os: Os, override_value: Option<&str>) -> Result<Self, ProviderError> {
        if let Some(value) = override_value.filter(|value| !value.trim().is_empty()) {
            let provider: Provider = value.parse()?;
            if provider == Provider::Krunkit && arch == Arch::X86_64 {
                return Err(ProviderError::UnsupportedArch { provider, arch });
            }
            debug!(%provider, "Provider chosen by override");
            return Ok(provider);
        }

        match (os, arch) {
            (Os::MacOs, Arch::Aarch64) => Ok(Provider::Krunkit),
            (Os::MacOs, Arch::X86_64) => Ok(Provider::Vfkit),
            (os, arch) => Err(ProviderError::Unsupported { arch, os }),
        }
    }

    /// Decompress the user's boot image into the machine's managed boot disk.
    #[tracing::instrument(skip(ctx, config), fields(name = %config.name))]
    pub async fn extract_bootable(
        self,
        ctx: &Context,
        source: &Path,
        config: &MachineConfig,
    ) -> Result<(), ProviderError> {
        ctx.decompressor()
            .decompress(source, &config.bootable.path)
            .await
            .map_err(|source_error| ProviderError::ExtractBootable {
                source_path: source.to_path_buf(),
                source: source_error,
            })?;
        info!(
            disk = %config.bootable.path.display(),
            version = %config.bootable.version,
            "Boot disk extracted"
        );
        Ok(())
    }

    /// Fill in the hypervisor-specific part of a new machine's config.
    pub fn create_vm_config(self, config: &mut MachineConfig) {
        match self {
            Provider::Vfkit => vfkit::create_vm_config(config),
            Provider::Krunkit => krunkit::create_vm_config(config),
        }
    }

    /// Spawn the network backend wired up for this hypervisor.
    pub fn start_networking(
        self,
        config: &MachineConfig,
        gvproxy: GvproxyCommand,
    ) -> Result<ProcessHandle, ProviderError> {
        // vfkit and krunkit both speak the vfkit datagram protocol
        let mut command = gvproxy
            .listen_vfkit(&config.network.transport_socket)
            .to_command();
        debug!(command = %command, "Starting network backend");
        ProcessHandle::spawn("gvproxy", &mut command).map_err(|source| ProviderError::Spawn {
            what: "network backend",
            source,
        })
    }

    pub fn start_vm(self, ctx: &Context, config: &MachineConfig) -> Result<ProcessHandle, ProviderError> {
        let binary = ctx.executables().hypervisor(self);
        let mut command = match self {
            Provider::Vfkit => vfkit::command(binary, config)?,
            Provider::Krunkit => krunkit::command(binary, config),
        };
        info!(provider = %self, command = %command, "Starting hypervisor");
        ProcessHandle::spawn(self.name(), &mut command).map_err(|source| ProviderError::Spawn {
            what: "hypervisor",
            source,
        })
    }

    /// Ask the running hypervisor for its state. No REST socket means no VM.
    pub async fn state(self, config: &MachineConfig) -> VmState {
        let Some(socket) = &config.hypervisor.rest_socket else {
            return VmState::Stopped;
        };
        match http::get(socket, "/vm/state").await {
            Ok(response) => match response.json::<RestState>("/vm/state") {
                Ok(rest) => VmState::from_rest(&rest.state),
                Err(error) => {
                    warn!(%error, "Unreadable hypervisor state");
                    VmState::Error
                }
            },
            Err(HttpError::Connect { .. }) => VmState::Stopped,
            Err(error) => {
                warn!(%error, "Failed to query hypervisor state");
                VmState::Error
            }
        }
    }
}
