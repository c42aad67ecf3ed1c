//! Command authentication and device request signing.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::SignatureError;

/// Verifies backend signatures over command payloads.
pub trait CommandVerifier: Send + Sync {
    fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<(), SignatureError>;
}

/// Signs device-originated requests.
pub trait DeviceSigner: Send + Sync {
    fn sign(&self, payload: &[u8]) -> Vec<u8>;
    fn public_key_hex(&self) -> String;
}

/// Ed25519 verifier holding the backend public key provisioned on the device.
#[derive(Debug, Clone)]
pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Ed25519Verifier {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            SignatureError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        let key = VerifyingKey::from_bytes(&arr)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl CommandVerifier for Ed25519Verifier {
    fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        let signature =
            Signature::from_slice(signature).map_err(|e| SignatureError::Malformed(e.to_string()))?;
        self.key
            .verify(payload, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}

pub struct Ed25519Signer {
    key: SigningKey,
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

impl Ed25519Signer {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl DeviceSigner for Ed25519Signer {
    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.key.sign(payload).to_bytes().to_vec()
    }

    fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_only_matching_signatures() {
        let backend = Ed25519Signer::from_seed(&[9u8; 32]);
        let verifier = Ed25519Verifier::from_hex(&backend.public_key_hex()).expect("key");
        let payload = b"cmd-1|LOCK_DEVICE|1000|1|n";
        let sig = backend.sign(payload);
        assert!(verifier.verify(payload, &sig).is_ok());
        assert_eq!(
            verifier.verify(b"cmd-1|UNLOCK_DEVICE|1000|1|n", &sig),
            Err(SignatureError::Mismatch)
        );
        assert!(matches!(
            verifier.verify(payload, &sig[..10]),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_bad_public_keys() {
        assert!(Ed25519Verifier::from_hex("zz").is_err());
        assert!(Ed25519Verifier::from_bytes(&[0u8; 31]).is_err());
    }
}
