use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X86_64,
    Aarch64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported CPU architecture: {0}")]
pub struct UnsupportedArch(pub String);

impl Arch {
    /// Architecture this binary was compiled for.
    pub fn host() -> Result<Self, UnsupportedArch> {
        std::env::consts::ARCH.parse()
    }
}

impl Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86-64"),
            Arch::Aarch64 => write!(f, "aarch64"),
        }
    }
}

impl FromStr for Arch {
    type Err = UnsupportedArch;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "x86-64" | "amd64" => Ok(Arch::X86_64),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            other => Err(UnsupportedArch(other.to_owned())),
        }
    }
}
