use cradle_cmd::Command;
use cradle_system::{CpuCount, MemorySize};
use std::path::{Path, PathBuf};

use crate::config::MachineConfig;
use crate::ignition::IGNITION_TAG;

/// MAC address of the guest's only NIC. gvproxy hands out its DHCP lease by MAC.
pub const GUEST_MAC: &str = "5a:94:ef:e4:0c:ee";

/// Command line shared by vfkit and krunkit: both take `--device` specs in the same syntax.
#[derive(Debug)]
pub struct HypervisorCommand {
    command: Command,
}

impl HypervisorCommand {
    pub fn new(binary: &Path) -> Self {
        Self {
            command: Command::new(binary),
        }
    }

    pub fn cpus(&mut self, cpus: CpuCount) -> &mut Self {
        self.command.arg("--cpus").arg(cpus.get().to_string());
        self
    }

    pub fn memory(&mut self, memory: MemorySize) -> &mut Self {
        self.command.arg("--memory").arg(memory.as_mib().to_string());
        self
    }

    pub fn efi_bootloader(&mut self, variable_store: &Path) -> &mut Self {
        self.command.arg("--bootloader").arg(format!(
            "efi,variable-store={},create",
            variable_store.display()
        ));
        self
    }

    fn device(&mut self, spec: String) -> &mut Self {
        self.command.arg("--device").arg(spec);
        self
    }

    pub fn disk(&mut self, path: &Path) -> &mut Self {
        self.device(format!("virtio-blk,path={}", path.display()))
    }

    pub fn rng(&mut self) -> &mut Self {
        self.device("virtio-rng".to_string())
    }

    pub fn network(&mut self, transport: &Path) -> &mut Self {
        self.device(format!(
            "virtio-net,unixSocketPath={},mac={GUEST_MAC}",
            transport.display()
        ))
    }

    pub fn share(&mut self, dir: &Path, tag: &str) -> &mut Self {
        self.device(format!("virtio-fs,sharedDir={},mountTag={tag}", dir.display()))
    }

    pub fn serial_log(&mut self, log: &Path) -> &mut Self {
        self.device(format!("virtio-serial,logFilePath={}", log.display()))
    }

    pub fn rest_socket(&mut self, socket: &Path) -> &mut Self {
        self.command
            .arg("--restful-uri")
            .arg(format!("unix://{}", socket.display()));
        self
    }

    /// Disks, network, mounts and the ignition share for `config`.
    pub fn machine_devices(&mut self, config: &MachineConfig) -> &mut Self {
        self.cpus(config.resources.cpus)
            .memory(config.resources.memory)
            .disk(&config.bootable.path)
            .disk(&config.data_disk.path)
            .rng()
            .network(&config.network.transport_socket);
        for mount in &config.mounts {
            self.share(&mount.source, &mount.tag);
        }
        self.share(&config.ignition.dir, IGNITION_TAG);
        if let Some(log) = &config.hypervisor.log_file {
            self.serial_log(log);
        }
        if let Some(socket) = &config.hypervisor.rest_socket {
            self.rest_socket(socket);
        }
        self
    }

    /// Send the process's own output next to the serial log.
    pub fn stdio_log(&mut self, log: PathBuf) -> &mut Self {
        self.command.log_to(log);
        self
    }

    pub fn into_command(self) -> Command {
        self.command
    }
}
