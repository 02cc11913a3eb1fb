use cradle_cmd::Command;
use std::path::Path;

use super::{HypervisorCommand, Provider, ProviderError};
use crate::config::MachineConfig;

const EFI_STORE_FILE: &str = "efi-bl-store";

pub(super) fn create_vm_config(config: &mut MachineConfig) {
    let name = &config.name;
    config.hypervisor.rest_socket = Some(config.dirs.sock_dir.join(format!("{name}-vfkit.sock")));
    config.hypervisor.log_file = Some(config.dirs.logs_dir.join(format!("{name}-vfkit.log")));
    config.hypervisor.efi_store = Some(config.dirs.data_dir.join(EFI_STORE_FILE));
}

/// vfkit boots through EFI, keeping its variable store next to the disks.
pub(super) fn command(binary: &Path, config: &MachineConfig) -> Result<Command, ProviderError> {
    let efi_store = config
        .hypervisor
        .efi_store
        .as_deref()
        .ok_or_else(|| ProviderError::NotConfigured {
            name: config.name.clone(),
            provider: Provider::Vfkit,
            what: "EFI variable store",
        })?;

    let mut command = HypervisorCommand::new(binary);
    command.efi_bootloader(efi_store).machine_devices(config);
    if let Some(log) = &config.hypervisor.log_file {
        command.stdio_log(log.with_extension("stdio.log"));
    }
    Ok(command.into_command())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::paths::Workspace;

    #[test]
    fn test_command_needs_efi_store() {
        let workspace = Workspace::new("/w");
        let config = sample(&workspace, "dev");
        assert!(matches!(
            command(Path::new("vfkit"), &config),
            Err(ProviderError::NotConfigured { .. })
        ));
    }

    #[test]
    fn test_command_boots_efi() {
        let workspace = Workspace::new("/w");
        let mut config = sample(&workspace, "dev");
        create_vm_config(&mut config);

        let line = command(Path::new("vfkit"), &config).unwrap().to_string();
        assert!(line.starts_with("vfkit --bootloader efi,variable-store=/w/data/vfkit/dev/efi-bl-store,create"));
        assert!(line.contains("virtio-serial,logFilePath=/w/logs/dev-vfkit.log"));
    }
}
