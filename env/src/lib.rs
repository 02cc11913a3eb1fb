use std::{
    env,
    path::{Path, PathBuf},
};

use cradle_system::Os;
use thiserror::Error;
use tracing::debug;

const PROJECT_NAME: &str = "cradle";

pub const HOME_VAR: &str = "CRADLE_HOME";

#[derive(Debug, Clone)]
pub struct Environment {
    root_dir: PathBuf,
}

#[derive(Error, Debug, Clone)]
pub enum EnvironmentError {
    #[error("cannot resolve the workspace root: neither {HOME_VAR} nor HOME is set")]
    NoHome,
}

impl Environment {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    /// Resolve the workspace root from the process environment.
    pub fn create() -> Result<Environment, EnvironmentError> {
        let environment = Self::resolve(Os::host(), |name| env::var(name).ok())?;
        debug!(root = %environment.root_dir.display(), "Resolved workspace root");
        Ok(environment)
    }

    /// `CRADLE_HOME` wins; otherwise the platform's per-user data directory.
    pub fn resolve<F>(os: Os, var: F) -> Result<Environment, EnvironmentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| var(name).filter(|value| !value.is_empty());

        if let Some(root) = var(HOME_VAR) {
            return Ok(Environment::new(root.into()));
        }

        let root = match os {
            Os::MacOs => {
                let home: PathBuf = var("HOME").ok_or(EnvironmentError::NoHome)?.into();
                home.join("Library")
                    .join("Application Support")
                    .join(PROJECT_NAME)
            }
            _ => {
                let data_dir: PathBuf = match var("XDG_DATA_HOME") {
                    Some(dir) => dir.into(),
                    None => {
                        let home: PathBuf = var("HOME").ok_or(EnvironmentError::NoHome)?.into();
                        home.join(".local").join("share")
                    }
                };
                data_dir.join(PROJECT_NAME)
            }
        };

        Ok(Environment::new(root))
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }
}
