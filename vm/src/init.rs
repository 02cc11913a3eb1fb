use cradle_fs::{self as fs, FsError};
use cradle_ssh::{SshKeypair, SshKeypairError};
use cradle_system::{CpuCount, MemorySize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ConfigStore, MachineConfig, NewMachine, Resources, validate_name};
use crate::context::Context;
use crate::events::Stage;
use crate::ignition::{self, IgnitionError, IgnitionRequest, TimezonePolicy};
use crate::mount::{MountError, MountSpec, parse_volumes};
use crate::ports::{DEFAULT_SSH_PORT, PortAllocator, PortError};
use crate::provider::ProviderError;
use crate::rollback::{RollbackAction, RollbackLedger};
use crate::signals::{Signal, wait_for_termination};

pub const DEFAULT_CPUS: u16 = 2;
pub const DEFAULT_MEMORY_MIB: u64 = 2048;
pub const DEFAULT_DISK_SIZE_GIB: u64 = 100;
pub const DEFAULT_USERNAME: &str = "core";

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum InitError {
    #[error("invalid machine name")]
    InvalidName(#[source] ConfigError),

    #[error("a boot image is required to create machine '{name}'")]
    MissingBootImage { name: String },

    #[error("boot image '{path}' does not exist")]
    BootImageNotFound { path: PathBuf },

    #[error("invalid volume")]
    Mounts(#[from] MountError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to create machine directory")]
    Directories(#[source] FsError),

    #[error("failed to prepare SSH keypair")]
    Keypair(#[from] SshKeypairError),

    #[error("failed to allocate SSH port")]
    Port(#[from] PortError),

    #[error("failed to extract boot image")]
    ExtractBootable(#[source] ProviderError),

    #[error("failed to create data disk '{path}'")]
    CreateDataDisk {
        path: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("failed to write ignition script")]
    Ignition(#[from] IgnitionError),

    #[error("failed to write machine config")]
    WriteConfig(#[source] ConfigError),

    #[error("interrupted by {0}")]
    Interrupted(Signal),
}

/// What `init` was asked to create or update.
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub name: String,
    /// Required when the machine does not exist yet or the boot version changes.
    pub boot_image: Option<PathBuf>,
    pub boot_version: String,
    pub data_version: String,
    pub cpus: CpuCount,
    pub memory: MemorySize,
    pub disk_size_gib: u64,
    pub volumes: Vec<String>,
    pub username: String,
    pub timezone: TimezonePolicy,
    /// Roll back and stop on SIGINT/SIGTERM while a new machine is being created.
    pub listen_for_signals: bool,
}

impl InitOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            boot_image: None,
            boot_version: String::new(),
            data_version: String::new(),
            cpus: CpuCount::new(DEFAULT_CPUS),
            memory: MemorySize::from_mib(DEFAULT_MEMORY_MIB),
            disk_size_gib: DEFAULT_DISK_SIZE_GIB,
            volumes: Vec::new(),
            username: DEFAULT_USERNAME.to_string(),
            timezone: TimezonePolicy::Host,
            listen_for_signals: false,
        }
    }
}

/// Create the machine named in `options`, or bring an existing one up to date.
///
/// Creating is all or nothing: a failure or a termination signal undoes every step
/// taken so far. Updating is not: an image replaced before a later step fails stays
/// replaced.
#[tracing::instrument(skip_all, fields(name = %options.name))]
pub async fn init(ctx: &Context, options: InitOptions) -> Result<MachineConfig, InitError> {
    validate_name(&options.name).map_err(InitError::InvalidName)?;
    let mounts = parse_volumes(&options.volumes)?;
    if let Some(boot_image) = &options.boot_image {
        if !fs::path_exists(boot_image).await.unwrap_or(false) {
            return Err(InitError::BootImageNotFound {
                path: boot_image.clone(),
            });
        }
    }

    let store = ConfigStore::open(ctx.workspace(), ctx.provider()).await?;
    let _lock = store.lock(&options.name).await?;

    let config = match store.load(&options.name).await {
        Ok(existing) => update(ctx, existing, &options, mounts).await?,
        Err(ConfigError::NotFound { .. }) => create_with_rollback(ctx, &store, &options, mounts).await?,
        Err(error) => return Err(error.into()),
    };

    ctx.events().emit(Stage::Init, &config.name, config.bootable.version.clone());
    Ok(config)
}

async fn create_with_rollback(
    ctx: &Context,
    store: &ConfigStore,
    options: &InitOptions,
    mounts: Vec<MountSpec>,
) -> Result<MachineConfig, InitError> {
    let boot_image = options
        .boot_image
        .as_deref()
        .ok_or_else(|| InitError::MissingBootImage {
            name: options.name.clone(),
        })?;

    let ledger = RollbackLedger::new();
    let outcome = tokio::select! {
        outcome = create(ctx, store, options, mounts, boot_image, &ledger) => outcome,
        signal = termination(options.listen_for_signals) => {
            let undone = ledger.run_on_signal().await;
            warn!(%signal, undone, "Machine creation interrupted");
            return Err(InitError::Interrupted(signal));
        }
    };

    match &outcome {
        Ok(_) => ledger.commit(),
        Err(error) => {
            warn!(%error, "Machine creation failed, rolling back");
            ledger.run_if_failed(&outcome).await;
        }
    }
    outcome
}

/// Resolves on the first termination signal, or never when not listening.
async fn termination(listen: bool) -> Signal {
    if listen {
        match wait_for_termination(&CancellationToken::new()).await {
            Ok(Some(signal)) => return signal,
            Ok(None) => {}
            Err(error) => warn!(%error, "Signals will not interrupt init"),
        }
    }
    std::future::pending().await
}

async fn create(
    ctx: &Context,
    store: &ConfigStore,
    options: &InitOptions,
    mounts: Vec<MountSpec>,
    boot_image: &Path,
    ledger: &RollbackLedger,
) -> Result<MachineConfig, InitError> {
    let provider = ctx.provider();
    let workspace = ctx.workspace();

    let machine_dir = workspace.machine_data_dir(provider, &options.name);
    if !fs::path_exists(&machine_dir).await.map_err(InitError::Directories)? {
        ledger.add(RollbackAction::remove_dir(machine_dir.clone()));
    }
    fs::create_dir(&machine_dir).await.map_err(InitError::Directories)?;

    SshKeypair::load_or_create(&machine_dir).await?;

    let allocator = PortAllocator::for_workspace(workspace);
    let ssh_port = allocator.allocate_preferring(DEFAULT_SSH_PORT).await?;
    ledger.add(RollbackAction::release_port(allocator, ssh_port));

    let mut config = MachineConfig::new(
        workspace,
        provider,
        NewMachine {
            name: options.name.clone(),
            resources: Resources {
                cpus: options.cpus,
                memory: options.memory,
                disk_size_gib: options.disk_size_gib,
            },
            boot_version: options.boot_version.clone(),
            data_version: options.data_version.clone(),
            mounts,
            ssh_identity: SshKeypair::private_key_path(&machine_dir),
            ssh_port,
            ssh_user: options.username.clone(),
        },
    );

    ledger.add(RollbackAction::remove_file(config.bootable.path.clone()));
    ledger.add(RollbackAction::remove_file(fs::temp_path_for(&config.bootable.path)));
    provider
        .extract_bootable(ctx, boot_image, &config)
        .await
        .map_err(InitError::ExtractBootable)?;

    provider.create_vm_config(&mut config);

    ledger.add(RollbackAction::remove_file(config.data_disk.path.clone()));
    create_data_disk(&config).await?;

    ledger.add(RollbackAction::remove_file(config.ignition.script.clone()));
    write_ignition(&config, &options.timezone).await?;

    ledger.add(RollbackAction::remove_file(store.config_path(&config.name)));
    config.write().await.map_err(InitError::WriteConfig)?;

    info!(
        name = %config.name,
        %provider,
        ssh_port,
        boot = %config.bootable.version,
        data = %config.data_disk.version,
        "Machine created"
    );
    Ok(config)
}

async fn update(
    ctx: &Context,
    mut config: MachineConfig,
    options: &InitOptions,
    mounts: Vec<MountSpec>,
) -> Result<MachineConfig, InitError> {
    if config.bootable.version != options.boot_version {
        let boot_image = options
            .boot_image
            .as_deref()
            .ok_or_else(|| InitError::MissingBootImage {
                name: options.name.clone(),
            })?;
        info!(
            from = %config.bootable.version,
            to = %options.boot_version,
            "Boot image version changed, re-extracting"
        );
        config.bootable.version = options.boot_version.clone();
        config
            .provider
            .extract_bootable(ctx, boot_image, &config)
            .await
            .map_err(InitError::ExtractBootable)?;
    } else {
        debug!(version = %config.bootable.version, "Boot image up to date");
    }

    if config.data_disk.version != options.data_version {
        info!(
            from = %config.data_disk.version,
            to = %options.data_version,
            "Data image version changed, recreating"
        );
        config.data_disk.version = options.data_version.clone();
        config.resources.disk_size_gib = options.disk_size_gib;
        fs::remove_file_if_exists(&config.data_disk.path)
            .await
            .map_err(|source| InitError::CreateDataDisk {
                path: config.data_disk.path.clone(),
                source,
            })?;
        create_data_disk(&config).await?;
    } else {
        debug!(version = %config.data_disk.version, "Data image up to date");
    }

    config.resources.cpus = options.cpus;
    config.resources.memory = options.memory;
    config.mounts = mounts;
    write_ignition(&config, &options.timezone).await?;
    config.write().await.map_err(InitError::WriteConfig)?;

    info!(name = %config.name, "Machine updated");
    Ok(config)
}

async fn create_data_disk(config: &MachineConfig) -> Result<(), InitError> {
    let path = &config.data_disk.path;
    let size = config.resources.disk_size_gib.saturating_mul(GIB);
    fs::create_sparse_file(path, size)
        .await
        .map_err(|source| InitError::CreateDataDisk {
            path: path.clone(),
            source,
        })?;
    debug!(path = %path.display(), size, "Created data disk");
    Ok(())
}

async fn write_ignition(config: &MachineConfig, timezone: &TimezonePolicy) -> Result<(), InitError> {
    let request = IgnitionRequest {
        mounts: &config.mounts,
        ssh_identity: Some(config.ssh.identity_path.as_path()),
        ssh_user: &config.ssh.remote_username,
        timezone: timezone.clone(),
        machine_type: config.provider.name(),
    };
    let payload = ignition::generate(&request).await?;
    ignition::write(&config.ignition.script, &payload).await?;
    Ok(())
}
