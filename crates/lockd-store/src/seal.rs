use aes_gcm_siv::{
    Aes256GcmSiv, Nonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::{StoreError, StoreResult, key::DeviceKey};

const MAGIC: &[u8; 4] = b"LKD1";
const NONCE_LEN: usize = 12;

/// AES-256-GCM-SIV envelope: `LKD1 || nonce(12) || ciphertext`. The record key
/// is bound as associated data so records cannot be swapped between keys.
#[derive(Clone)]
pub struct Sealer {
    cipher: Aes256GcmSiv,
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Sealer(..)")
    }
}

impl Sealer {
    pub fn new(key: &DeviceKey) -> StoreResult<Self> {
        let cipher = Aes256GcmSiv::new_from_slice(key.as_bytes())
            .map_err(|e| StoreError::KeyMaterial(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, aad: &str, plaintext: &[u8]) -> StoreResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce).map_err(|e| StoreError::KeyMaterial(e.to_string()))?;
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|e| StoreError::Seal {
                key: aad.to_string(),
                reason: e.to_string(),
            })?;
        let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, aad: &str, sealed: &[u8]) -> StoreResult<Vec<u8>> {
        let fail = |reason: &str| StoreError::Seal {
            key: aad.to_string(),
            reason: reason.to_string(),
        };
        if sealed.len() < MAGIC.len() + NONCE_LEN {
            return Err(fail("envelope too short"));
        }
        let (magic, rest) = sealed.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err(fail("bad envelope magic"));
        }
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| fail("authentication failed"))
    }
}
