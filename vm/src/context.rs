use cradle_env::{Environment, EnvironmentError};
use cradle_system::{Arch, Os, UnsupportedArch};
use std::sync::Arc;
use thiserror::Error;

use crate::decompress::{CommandDecompressor, Decompress};
use crate::events::Events;
use crate::paths::{ExecutablePaths, Workspace};
use crate::provider::{Provider, ProviderError};
use crate::shell::{RemoteShell, SshShell};

#[derive(Error, Debug)]
pub enum ContextError {
    #[error(transparent)]
    Env(#[from] EnvironmentError),

    #[error(transparent)]
    Arch(#[from] UnsupportedArch),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Everything an operation needs to know about the host, built once per process.
#[derive(Debug, Clone)]
pub struct Context {
    workspace: Workspace,
    provider: Provider,
    executables: ExecutablePaths,
    shell: Arc<dyn RemoteShell>,
    decompressor: Arc<dyn Decompress>,
    events: Events,
}

impl Context {
    pub fn new(workspace: Workspace, provider: Provider, executables: ExecutablePaths) -> Self {
        let decompressor = CommandDecompressor::new(&executables.zstd, &executables.xz);
        Self {
            workspace,
            provider,
            executables,
            shell: Arc::new(SshShell::default()),
            decompressor: Arc::new(decompressor),
            events: Events::disabled(),
        }
    }

    /// Resolve the workspace, provider and helper executables from the process environment.
    pub fn from_env() -> Result<Self, ContextError> {
        let env = Environment::create()?;
        let override_value = std::env::var(Provider::OVERRIDE_VAR).ok();
        let provider = Provider::select(Arch::host()?, Os::host(), override_value.as_deref())?;
        Ok(Self::new(
            Workspace::new(env.root_dir()),
            provider,
            ExecutablePaths::from_env(),
        ))
    }

    pub fn with_shell(mut self, shell: Arc<dyn RemoteShell>) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_decompressor(mut self, decompressor: Arc<dyn Decompress>) -> Self {
        self.decompressor = decompressor;
        self
    }

    pub fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn executables(&self) -> &ExecutablePaths {
        &self.executables
    }

    pub fn shell(&self) -> &Arc<dyn RemoteShell> {
        &self.shell
    }

    pub fn decompressor(&self) -> &dyn Decompress {
        self.decompressor.as_ref()
    }

    pub fn events(&self) -> &Events {
        &self.events
    }
}
