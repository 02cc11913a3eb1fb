mod report;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use comfy_table::Table;
use cradle_system::{CpuCount, MemorySize};
use cradle_vm::{
    ConfigError, Context, ContextError, DEFAULT_CPUS, DEFAULT_DISK_SIZE_GIB, DEFAULT_MEMORY_MIB,
    DEFAULT_USERNAME, Events, InitError, InitOptions, MachineConfig, StartError, StartOptions,
    TimezonePolicy,
};
use reqwest::Url;
use thiserror::Error;
use tracing::{info, warn};

pub use crate::report::{REPORT_TIMEOUT, forward_events};

#[derive(Parser, Debug)]
#[command(name = "cradle", version, about = "Run a lightweight Linux VM")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(long = "log", global = true, default_value = "info")]
    pub log: String,

    /// Endpoint pinged with `?stage=&name=&value=` as the machine moves through its lifecycle.
    #[arg(long = "report-url", global = true, env = "CRADLE_REPORT_URL")]
    pub report_url: Option<Url>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a machine, or bring an existing one up to date
    Init {
        name: String,

        /// Compressed boot image (.zst, .xz or raw)
        #[arg(long = "boot")]
        boot_image: Option<PathBuf>,

        #[arg(long = "boot-version")]
        boot_version: String,

        #[arg(long = "data-version")]
        data_version: String,

        #[arg(long = "cpus", default_value_t = DEFAULT_CPUS)]
        cpus: u16,

        /// Memory in MiB
        #[arg(long = "memory", default_value_t = DEFAULT_MEMORY_MIB)]
        memory: u64,

        /// Data disk size in GiB
        #[arg(long = "disk-size", default_value_t = DEFAULT_DISK_SIZE_GIB)]
        disk_size_gib: u64,

        /// SOURCE:TARGET[:ro|:rw], repeatable
        #[arg(long = "volume", short = 'v')]
        volumes: Vec<String>,

        #[arg(long = "username", default_value = DEFAULT_USERNAME)]
        username: String,

        /// Guest timezone. Defaults to the host's; `none` leaves the guest untouched.
        #[arg(long = "timezone")]
        timezone: Option<String>,
    },
    /// Boot a machine and keep it running until it stops
    Start {
        name: String,

        /// Stop when this process exits. Defaults to the parent process.
        #[arg(long = "parent-pid")]
        parent_pid: Option<u32>,

        #[arg(long = "no-parent-watch", conflicts_with = "parent_pid")]
        no_parent_watch: bool,
    },
    /// Print a machine's hypervisor state
    State { name: String },
    /// List machines
    List,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Start(#[from] StartError),
}

pub async fn run(cli: Cli) -> Result<(), AppError> {
    let Cli {
        command,
        log: _,
        report_url,
    } = cli;

    let ctx = Context::from_env()?;
    let (ctx, forwarder) = match report_url {
        Some(url) => {
            let (events, rx) = Events::channel();
            (ctx.with_events(events), Some(forward_events(url, rx)))
        }
        None => (ctx, None),
    };

    let result = match command {
        Command::Init {
            name,
            boot_image,
            boot_version,
            data_version,
            cpus,
            memory,
            disk_size_gib,
            volumes,
            username,
            timezone,
        } => {
            let mut options = InitOptions::new(name);
            options.boot_image = boot_image;
            options.boot_version = boot_version;
            options.data_version = data_version;
            options.cpus = CpuCount::new(cpus);
            options.memory = MemorySize::from_mib(memory);
            options.disk_size_gib = disk_size_gib;
            options.volumes = volumes;
            options.username = username;
            options.timezone = timezone_policy(timezone);
            options.listen_for_signals = true;
            cmd_init(&ctx, options).await
        }
        Command::Start {
            name,
            parent_pid,
            no_parent_watch,
        } => {
            let mut options = StartOptions::default();
            if no_parent_watch {
                options.parent_pid = None;
            } else if let Some(pid) = parent_pid {
                options.parent_pid = Some(pid);
            }
            cradle_vm::start(&ctx, &name, options).await.map_err(AppError::from)
        }
        Command::State { name } => cmd_state(&ctx, &name).await,
        Command::List => cmd_list(&ctx).await,
    };

    // closes the event channel so the forwarder can drain
    drop(ctx);
    if let Some(forwarder) = forwarder {
        if tokio::time::timeout(REPORT_TIMEOUT, forwarder).await.is_err() {
            warn!("Gave up waiting for event reports");
        }
    }

    result
}

fn timezone_policy(timezone: Option<String>) -> TimezonePolicy {
    match timezone.as_deref() {
        None => TimezonePolicy::Host,
        Some("none") => TimezonePolicy::Skip,
        Some(zone) => TimezonePolicy::Zone(zone.to_string()),
    }
}

async fn cmd_init(ctx: &Context, options: InitOptions) -> Result<(), AppError> {
    let config = cradle_vm::init(ctx, options).await?;
    info!(
        name = %config.name,
        path = ?config.path(),
        ssh_port = config.ssh.port,
        "Machine ready to start"
    );
    Ok(())
}

async fn cmd_state(ctx: &Context, name: &str) -> Result<(), AppError> {
    let state = cradle_vm::state(ctx, name).await?;
    println!("{state}");
    Ok(())
}

async fn cmd_list(ctx: &Context) -> Result<(), AppError> {
    let machines = cradle_vm::list(ctx).await?;
    println!("{}", machines_table(machines.values()));
    Ok(())
}

fn machines_table<'a>(machines: impl Iterator<Item = &'a MachineConfig>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS)
        .set_content_arrangement(comfy_table::ContentArrangement::Dynamic)
        .set_header(vec![
            "name", "provider", "cpus", "memory", "boot", "data", "ssh port", "last up",
        ]);

    for config in machines {
        let last_up = config
            .last_up
            .map(|at| at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
            .unwrap_or_else(|| "never".to_string());
        table.add_row(vec![
            config.name.clone(),
            config.provider.to_string(),
            config.resources.cpus.to_string(),
            config.resources.memory.to_string(),
            config.bootable.version.clone(),
            config.data_disk.version.clone(),
            config.ssh.port.to_string(),
            last_up,
        ]);
    }

    table
}
