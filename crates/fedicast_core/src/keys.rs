/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// PEM-encoded RSA key pair of one local actor.
#[derive(Clone)]
pub struct KeyPair {
    pub public_key_pem: String,
    pub private_key_pem: String,
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("FEDICAST_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "fedicast", "Fedicast")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

pub fn generate_keypair(bits: usize) -> Result<KeyPair> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, bits).context("generate rsa key")?;
    keypair_from_private(&private_key)
}

pub fn keypair_from_private_pem(private_key_pem: &str) -> Result<KeyPair> {
    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .context("parse private key pem")?;
    keypair_from_private(&private_key)
}

fn keypair_from_private(private_key: &RsaPrivateKey) -> Result<KeyPair> {
    let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let public_key_pem = RsaPublicKey::from(private_key)
        .to_public_key_pem(LineEnding::LF)?
        .to_string();
    Ok(KeyPair {
        public_key_pem,
        private_key_pem,
    })
}

/// Instance-level key used for signed fetches; created on first start.
pub fn load_or_generate_instance_key(dir: impl AsRef<Path>) -> Result<KeyPair> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("create data dir: {}", dir.display()))?;

    let priv_path = dir.join("instance_private_key.pem");
    if priv_path.exists() {
        let pem = fs::read_to_string(&priv_path).with_context(|| format!("read {}", priv_path.display()))?;
        return keypair_from_private_pem(&pem);
    }
    let pair = generate_keypair(2048)?;
    fs::write(&priv_path, &pair.private_key_pem).with_context(|| format!("write {}", priv_path.display()))?;
    Ok(pair)
}

#[cfg(test)]
pub(crate) mod test_keys {
    use super::*;
    use std::sync::OnceLock;

    /// One small key shared by every test in the crate; generation is slow.
    pub fn shared() -> &'static KeyPair {
        static KEYS: OnceLock<KeyPair> = OnceLock::new();
        KEYS.get_or_init(|| generate_keypair(1024).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_instance_key_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let shared = test_keys::shared();
        fs::write(dir.path().join("instance_private_key.pem"), &shared.private_key_pem).unwrap();
        let loaded = load_or_generate_instance_key(dir.path()).unwrap();
        assert_eq!(loaded.public_key_pem, shared.public_key_pem);
        assert!(loaded.public_key_pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }
}
