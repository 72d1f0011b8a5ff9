//! SSH keypair generation for dynamic nodepools.

use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("ssh key generation failed: {0}")]
pub struct KeyError(String);

/// OpenSSH-encoded keypair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKeyPair {
    pub public_key: String,
    pub private_key: String,
}

/// Generate a fresh ed25519 keypair.
pub fn generate_ssh_keypair() -> Result<SshKeyPair, KeyError> {
    let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| KeyError(e.to_string()))?;
    let private_key = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| KeyError(e.to_string()))?
        .to_string();
    let public_key = private
        .public_key()
        .to_openssh()
        .map_err(|e| KeyError(e.to_string()))?;
    Ok(SshKeyPair {
        public_key,
        private_key,
    })
}
