mod common;

use common::{CopyDecompressor, context, init_options, write_image};
use cradle_vm::{ConfigStore, PortAllocator, Provider, init, list};
use std::sync::Arc;

#[tokio::test]
async fn test_init_creates_machine() {
    let dir = tempfile::tempdir().unwrap();
    let decompressor = Arc::new(CopyDecompressor::default());
    let ctx = context(dir.path(), decompressor.clone());
    let image = write_image(dir.path(), "image.raw.zst", b"boot v1");

    let config = init(&ctx, init_options("dev", &image, "v1.0")).await.unwrap();

    let config_path = ctx.workspace().config_dir(Provider::Vfkit).join("dev.json");
    assert_eq!(config.path(), Some(config_path.as_path()));
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
    assert_eq!(json["Resources"]["CPUs"], 2);
    assert_eq!(json["Resources"]["Memory"], 1024);
    assert_eq!(json["Bootable"]["Version"], "v1.0");

    assert_eq!(std::fs::read(&config.bootable.path).unwrap(), b"boot v1");
    assert_eq!(std::fs::metadata(&config.data_disk.path).unwrap().len(), 1 << 30);
    assert!(config.ignition.script.exists());
    assert!(config.ssh.identity_path.exists());
    assert!(config.hypervisor.rest_socket.is_some());
    assert_eq!(decompressor.calls().len(), 1);

    let claimed = PortAllocator::for_workspace(ctx.workspace()).claimed().await.unwrap();
    assert_eq!(claimed, vec![config.ssh.port]);

    let machines = list(&ctx).await.unwrap();
    assert_eq!(machines.keys().collect::<Vec<_>>(), vec!["dev"]);
}

#[tokio::test]
async fn test_boot_version_change_replaces_only_boot_disk() {
    let dir = tempfile::tempdir().unwrap();
    let decompressor = Arc::new(CopyDecompressor::default());
    let ctx = context(dir.path(), decompressor.clone());
    let first = write_image(dir.path(), "v1.raw.zst", b"boot v1");
    let created = init(&ctx, init_options("dev", &first, "v1.0")).await.unwrap();
    std::fs::write(&created.data_disk.path, b"guest data").unwrap();

    let second = write_image(dir.path(), "v2.raw.zst", b"boot v2");
    let updated = init(&ctx, init_options("dev", &second, "v2.0")).await.unwrap();

    assert_eq!(updated.bootable.version, "v2.0");
    assert_eq!(std::fs::read(&updated.bootable.path).unwrap(), b"boot v2");
    assert_eq!(std::fs::read(&updated.data_disk.path).unwrap(), b"guest data");
    assert_eq!(updated.ssh.port, created.ssh.port);
    assert_eq!(decompressor.calls().len(), 2);

    let store = ConfigStore::new(ctx.workspace().config_dir(Provider::Vfkit));
    assert_eq!(store.load("dev").await.unwrap().bootable.version, "v2.0");
}

#[tokio::test]
async fn test_same_versions_skip_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let decompressor = Arc::new(CopyDecompressor::default());
    let ctx = context(dir.path(), decompressor.clone());
    let image = write_image(dir.path(), "image.raw.zst", b"boot v1");
    let created = init(&ctx, init_options("dev", &image, "v1.0")).await.unwrap();

    let mut options = init_options("dev", &image, "v1.0");
    options.cpus = cradle_system::CpuCount::new(4);
    let updated = init(&ctx, options).await.unwrap();

    assert_eq!(decompressor.calls().len(), 1);
    assert_eq!(updated.resources.cpus, cradle_system::CpuCount::new(4));
    assert_eq!(updated.created, created.created);
}

#[tokio::test]
async fn test_existing_machine_needs_no_image_when_versions_match() {
    let dir = tempfile::tempdir().unwrap();
    let decompressor = Arc::new(CopyDecompressor::default());
    let ctx = context(dir.path(), decompressor.clone());
    let image = write_image(dir.path(), "image.raw.zst", b"boot v1");
    init(&ctx, init_options("dev", &image, "v1.0")).await.unwrap();

    let mut options = init_options("dev", &image, "v1.0");
    options.boot_image = None;
    init(&ctx, options).await.unwrap();

    assert_eq!(decompressor.calls().len(), 1);
}

#[tokio::test]
async fn test_data_version_change_recreates_only_data_disk() {
    use std::io::Read;

    let dir = tempfile::tempdir().unwrap();
    let decompressor = Arc::new(CopyDecompressor::default());
    let ctx = context(dir.path(), decompressor.clone());
    let image = write_image(dir.path(), "image.raw.zst", b"boot v1");
    let created = init(&ctx, init_options("dev", &image, "v1.0")).await.unwrap();
    std::fs::write(&created.data_disk.path, b"guest data").unwrap();

    let mut options = init_options("dev", &image, "v1.0");
    options.data_version = "v2.0".to_string();
    options.disk_size_gib = 2;
    let updated = init(&ctx, options).await.unwrap();

    assert_eq!(decompressor.calls().len(), 1);
    assert_eq!(std::fs::read(&updated.bootable.path).unwrap(), b"boot v1");
    assert_eq!(std::fs::metadata(&updated.data_disk.path).unwrap().len(), 2 << 30);
    let mut head = [0xffu8; 10];
    std::fs::File::open(&updated.data_disk.path)
        .unwrap()
        .read_exact(&mut head)
        .unwrap();
    assert_eq!(head, [0u8; 10]);

    let store = ConfigStore::new(ctx.workspace().config_dir(Provider::Vfkit));
    let stored = store.load("dev").await.unwrap();
    assert_eq!(stored.data_disk.version, "v2.0");
    assert_eq!(stored.bootable.version, "v1.0");
}
