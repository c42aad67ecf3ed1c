//! Device-bound storage key.
//!
//! The key is derived from a random per-install secret kept in a `0600` file
//! next to the data, mixed with the device id so a copied data directory does
//! not open on another device.

use sha2::{Digest, Sha256};
use std::{
    fmt, fs,
    io::{ErrorKind, Write},
    path::Path,
};

use crate::{StoreError, StoreResult, io_error};

const KEY_DOMAIN: &[u8] = b"lockd-store-key-v1";
const SECRET_LEN: usize = 32;

#[derive(Clone)]
pub struct DeviceKey([u8; 32]);

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceKey(..)")
    }
}

impl DeviceKey {
    pub fn derive(device_id: &str, secret: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        hasher.update((device_id.len() as u64).to_le_bytes());
        hasher.update(device_id.as_bytes());
        hasher.update(secret);
        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        DeviceKey(key)
    }

    /// Load the install secret from `path`, creating it on first use.
    pub fn load_or_create(path: &Path, device_id: &str) -> StoreResult<Self> {
        match fs::read(path) {
            Ok(secret) if secret.len() == SECRET_LEN => Ok(Self::derive(device_id, &secret)),
            Ok(secret) => Err(StoreError::KeyMaterial(format!(
                "{} holds {} bytes, expected {SECRET_LEN}",
                path.display(),
                secret.len()
            ))),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let mut secret = [0u8; SECRET_LEN];
                getrandom::getrandom(&mut secret)
                    .map_err(|e| StoreError::KeyMaterial(e.to_string()))?;
                write_secret(path, &secret)?;
                log::info!("created device storage secret at {}", path.display());
                Ok(Self::derive(device_id, &secret))
            }
            Err(err) => Err(io_error(path, err)),
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

fn write_secret(path: &Path, secret: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| io_error(path, e))?;
    file.write_all(secret).map_err(|e| io_error(path, e))?;
    file.sync_all().map_err(|e| io_error(path, e))?;
    Ok(())
}
