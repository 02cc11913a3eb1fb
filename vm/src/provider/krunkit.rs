use cradle_cmd::Command;
use std::path::Path;

use super::HypervisorCommand;
use crate::config::MachineConfig;

pub(super) fn create_vm_config(config: &mut MachineConfig) {
    let name = &config.name;
    config.hypervisor.rest_socket = Some(config.dirs.sock_dir.join(format!("{name}-krunkit.sock")));
    config.hypervisor.log_file = Some(config.dirs.logs_dir.join(format!("{name}-krunkit.log")));
}

// libkrun carries its own firmware, so there is no bootloader flag.
pub(super) fn command(binary: &Path, config: &MachineConfig) -> Command {
    let mut command = HypervisorCommand::new(binary);
    command.machine_devices(config);
    if let Some(log) = &config.hypervisor.log_file {
        command.stdio_log(log.with_extension("stdio.log"));
    }
    command.into_command()
}
