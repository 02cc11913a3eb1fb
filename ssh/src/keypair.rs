use cradle_fs::{self as fs, FsError};
use russh::keys::ssh_key::{LineEnding, private::Ed25519Keypair, rand_core::OsRng};
use russh::keys::{PrivateKey, PublicKey};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SshKeypairError {
    #[error("SSH key encode/decode error: {0}")]
    RusshKey(#[from] russh::keys::ssh_key::Error),

    #[error(transparent)]
    Fs(#[from] FsError),
}

#[derive(Clone, Debug)]
pub struct SshKeypair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

pub const PRIVATE_KEY_FILE: &str = "id_ed25519";
pub const PUBLIC_KEY_FILE: &str = "id_ed25519.pub";

const PRIVATE_KEY_MODE: u32 = 0o600;

impl SshKeypair {
    pub fn private_key_path(directory: &Path) -> PathBuf {
        directory.join(PRIVATE_KEY_FILE)
    }

    pub fn public_key_path(directory: &Path) -> PathBuf {
        directory.join(PUBLIC_KEY_FILE)
    }

    /// Load keys from directory if present; otherwise create and save new keys.
    #[tracing::instrument(skip_all)]
    pub async fn load_or_create(directory: &Path) -> Result<Self, SshKeypairError> {
        if Self::exists(directory).await? {
            debug!("SSH keypair exists; loading");
            return Self::load(directory).await;
        }

        debug!("SSH keypair doesn't exist, creating");
        let keypair = Self::create();
        keypair.save(directory).await?;
        Ok(keypair)
    }

    pub fn create() -> Self {
        let ed25519 = Ed25519Keypair::random(&mut OsRng);
        Self {
            public_key: PublicKey::from(ed25519.public),
            private_key: PrivateKey::from(ed25519),
        }
    }

    // OpenSSH format, private key readable only by the owner.
    #[tracing::instrument(skip_all)]
    pub async fn save(&self, directory: &Path) -> Result<(), SshKeypairError> {
        fs::create_dir(directory).await?;

        let public_key_path = Self::public_key_path(directory);
        let private_key_path = Self::private_key_path(directory);

        let public_key_string = self.public_key.to_openssh()?;
        let private_key_string = self.private_key.to_openssh(LineEnding::default())?;

        fs::write_file(&public_key_path, public_key_string.as_bytes()).await?;
        fs::write_file(&private_key_path, private_key_string.as_bytes()).await?;
        fs::set_file_mode(&private_key_path, PRIVATE_KEY_MODE).await?;

        debug!(
            public_key = %public_key_path.display(),
            private_key = %private_key_path.display(),
            "Saved SSH keypair"
        );
        Ok(())
    }

    pub async fn exists(directory: &Path) -> Result<bool, SshKeypairError> {
        let public_key_exists = fs::path_exists(Self::public_key_path(directory)).await?;
        let private_key_exists = fs::path_exists(Self::private_key_path(directory)).await?;
        Ok(public_key_exists && private_key_exists)
    }

    #[tracing::instrument(skip_all)]
    pub async fn load(directory: &Path) -> Result<Self, SshKeypairError> {
        let public_key_path = Self::public_key_path(directory);
        let public_key_string = fs::read_file_to_string(&public_key_path).await?;
        let public_key = PublicKey::from_openssh(&public_key_string)?;
        let private_key = load_private_key(&Self::private_key_path(directory)).await?;

        Ok(Self {
            public_key,
            private_key,
        })
    }
}

/// Read an OpenSSH private key from an identity file.
pub async fn load_private_key(path: &Path) -> Result<PrivateKey, SshKeypairError> {
    let private_key_string = fs::read_file_to_string(path).await?;
    Ok(PrivateKey::from_openssh(&private_key_string)?)
}
