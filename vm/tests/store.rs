mod common;

use common::{CopyDecompressor, context, init_options, write_image};
use cradle_vm::{ConfigStore, PortAllocator, Provider, init, is_available};
use std::collections::BTreeSet;
use std::sync::Arc;

#[tokio::test]
async fn test_interrupted_write_keeps_previous_config() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), Arc::new(CopyDecompressor::default()));
    let image = write_image(dir.path(), "image.raw.zst", b"boot");
    let mut config = init(&ctx, init_options("dev", &image, "v1.0")).await.unwrap();
    let store = ConfigStore::new(ctx.workspace().config_dir(Provider::Vfkit));

    // a writer that died between writing the temp file and renaming it
    let path = store.config_path("dev");
    std::fs::write(cradle_fs::temp_path_for(&path), b"{\"Name\": \"de").unwrap();

    assert_eq!(store.load("dev").await.unwrap().bootable.version, "v1.0");

    config.bootable.version = "v2.0".to_string();
    config.write().await.unwrap();
    assert_eq!(store.load("dev").await.unwrap().bootable.version, "v2.0");
    assert_eq!(store.list_all().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_are_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let allocator = PortAllocator::new(
        dir.path().join("port-alloc.json"),
        dir.path().join("port-alloc.lock"),
    );

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.allocate().await })
        })
        .collect();
    let mut ports = BTreeSet::new();
    for task in tasks {
        ports.insert(task.await.unwrap().unwrap());
    }

    assert_eq!(ports.len(), 8);
    for port in &ports {
        assert!(is_available(*port));
    }
    let claimed: BTreeSet<u16> = allocator.claimed().await.unwrap().into_iter().collect();
    assert_eq!(claimed, ports);
}
