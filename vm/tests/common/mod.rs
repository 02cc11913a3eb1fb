#![allow(dead_code)]

use async_trait::async_trait;
use cradle_vm::{
    Context, Decompress, DecompressError, ExecutablePaths, InitOptions, Provider, RemoteOutput,
    RemoteShell, ShellError, ShellTarget, TimezonePolicy, Workspace,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Copies images instead of decompressing them, and remembers every call.
#[derive(Debug, Default)]
pub struct CopyDecompressor {
    calls: Mutex<Vec<(PathBuf, PathBuf)>>,
}

impl CopyDecompressor {
    pub fn calls(&self) -> Vec<(PathBuf, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Decompress for CopyDecompressor {
    async fn decompress(&self, source: &Path, target: &Path) -> Result<(), DecompressError> {
        self.calls
            .lock()
            .unwrap()
            .push((source.to_path_buf(), target.to_path_buf()));
        cradle_fs::copy_file(source, target).await?;
        Ok(())
    }
}

/// A guest that never answers: every command exits 255.
#[derive(Debug, Default)]
pub struct UnreachableShell;

#[async_trait]
impl RemoteShell for UnreachableShell {
    async fn run(
        &self,
        _target: &ShellTarget,
        _command: &str,
        _args: &[String],
    ) -> Result<RemoteOutput, ShellError> {
        Ok(RemoteOutput {
            output: "connection refused".to_string(),
            exit_status: 255,
        })
    }
}

/// A guest that answers every command, remembering each one and whether `watched`
/// existed when it ran.
#[derive(Debug)]
pub struct RecordingShell {
    watched: PathBuf,
    calls: Mutex<Vec<(String, bool)>>,
}

impl RecordingShell {
    pub fn new(watched: &Path) -> Self {
        Self {
            watched: watched.to_path_buf(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteShell for RecordingShell {
    async fn run(
        &self,
        _target: &ShellTarget,
        command: &str,
        args: &[String],
    ) -> Result<RemoteOutput, ShellError> {
        let line = std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push((line, self.watched.exists()));
        Ok(RemoteOutput {
            output: String::new(),
            exit_status: 0,
        })
    }
}

pub fn executables(dir: &Path) -> ExecutablePaths {
    ExecutablePaths {
        gvproxy: dir.join("gvproxy"),
        vfkit: dir.join("vfkit"),
        krunkit: dir.join("krunkit"),
        zstd: dir.join("zstd"),
        xz: dir.join("xz"),
    }
}

pub fn context(root: &Path, decompressor: Arc<CopyDecompressor>) -> Context {
    Context::new(Workspace::new(root), Provider::Vfkit, executables(&root.join("bin")))
        .with_decompressor(decompressor)
        .with_shell(Arc::new(UnreachableShell))
}

pub fn write_image(dir: &Path, file: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(file);
    std::fs::write(&path, content).unwrap();
    path
}

pub fn init_options(name: &str, image: &Path, boot_version: &str) -> InitOptions {
    let mut options = InitOptions::new(name);
    options.boot_image = Some(image.to_path_buf());
    options.boot_version = boot_version.to_string();
    options.data_version = "v1.0".to_string();
    options.cpus = cradle_system::CpuCount::new(2);
    options.memory = cradle_system::MemorySize::from_mib(1024);
    options.disk_size_gib = 1;
    options.timezone = TimezonePolicy::Skip;
    options
}

pub fn write_script(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}
