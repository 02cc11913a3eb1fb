mod api;
mod clock;
mod config;
mod context;
mod decompress;
mod events;
mod http;
mod ignition;
mod init;
mod mount;
mod network;
mod paths;
mod ports;
mod process;
mod provider;
mod rollback;
mod scope;
mod shell;
mod signals;
mod start;
mod wait;
mod watchdog;

pub use crate::api::{API_SHUTDOWN_GRACE, ApiError, MachineInfo, serve_api};
pub use crate::clock::{ClockPolicy, detect_jump, resync_on_wake, sync_guest_clock};
pub use crate::config::{
    ConfigError, ConfigStore, Disk, ForwardSocket, GUEST_API_SOCKET, HypervisorConfig,
    IgnitionConfig, MachineConfig, MachineDirs, NetworkConfig, NewMachine, Processes, Resources,
    SshConfig, is_valid_name, validate_name,
};
pub use crate::context::{Context, ContextError};
pub use crate::decompress::{CommandDecompressor, Compression, Decompress, DecompressError};
pub use crate::events::{Events, Stage, VmEvent};
pub use crate::http::{HTTP_REQUEST_TIMEOUT, HttpError, UnixHttpResponse};
pub use crate::ignition::{
    IGNITION_GUEST_DIR, IGNITION_TAG, IgnitionError, IgnitionRequest, MACHINE_TYPE_FILE,
    TimezonePolicy,
};
pub use crate::init::{
    DEFAULT_CPUS, DEFAULT_DISK_SIZE_GIB, DEFAULT_MEMORY_MIB, DEFAULT_USERNAME, InitError,
    InitOptions, init,
};
pub use crate::mount::{MOUNT_TAG_LEN, MountError, MountSpec, MountType, mount_tag, parse_volumes};
pub use crate::network::{GvproxyCommand, NetworkError, TRANSPORT_WAIT, start_network};
pub use crate::paths::{ExecutablePaths, Workspace};
pub use crate::ports::{DEFAULT_SSH_PORT, MAX_PORT_ATTEMPTS, PortAllocator, PortError, is_available};
pub use crate::process::{ProcessError, ProcessExit, ProcessHandle, ProcessSupervisor, is_process_alive};
pub use crate::provider::{GUEST_MAC, Provider, ProviderError, VmState};
pub use crate::rollback::{RollbackAction, RollbackError, RollbackLedger};
pub use crate::scope::Scope;
pub use crate::shell::{RemoteOutput, RemoteShell, ShellError, ShellTarget, SshShell, run_privileged};
pub use crate::signals::{Signal, SignalError};
pub use crate::start::{StartError, StartOptions, start};
pub use crate::wait::{RetryPolicy, WaitError, poll_until, wait_for_path};
pub use crate::watchdog::{PARENT_POLL_INTERVAL, watch_parent};

/// Hypervisor state of machine `name`, `Stopped` if it has never been started.
pub async fn state(ctx: &Context, name: &str) -> Result<VmState, ConfigError> {
    let store = ConfigStore::open(ctx.workspace(), ctx.provider()).await?;
    let config = store.load(name).await?;
    Ok(config.provider.state(&config).await)
}

/// Every machine of the current provider, by name.
pub async fn list(
    ctx: &Context,
) -> Result<std::collections::BTreeMap<String, MachineConfig>, ConfigError> {
    ConfigStore::open(ctx.workspace(), ctx.provider()).await?.list_all().await
}
