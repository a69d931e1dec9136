//! Writer identities: secp256k1 keypairs, SHA3-256 hashing, and
//! recoverable ECDSA signatures.
//!
//! A writer is addressed by its `ClientId`, the hex SHA3-256 digest of the
//! hex-encoded uncompressed public key. Signatures are 65 bytes
//! (`r || s || recovery_id`) so that the signer's public key, and therefore
//! its `ClientId`, can be recovered from the signature alone.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::{Digest, Sha3_256};
use thiserror::Error;
use uuid::Uuid;

/// Hex SHA3-256 digest of a writer's hex-encoded public key.
pub type ClientId = String;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid private key hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("invalid private key length, expected 32 bytes, got {0}")]
    InvalidLength(usize),
    #[error("invalid private key scalar")]
    InvalidScalar,
    #[error("signing failed")]
    SigningFailed,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("public key recovery failed")]
    RecoveryFailed,
}

/// A secp256k1 keypair plus its derived `ClientId`.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    id: ClientId,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").field("id", &self.id).finish()
    }
}

impl Identity {
    /// Generates a fresh identity from the OS entropy source.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Rebuilds an identity from a hex-encoded 32-byte private scalar.
    ///
    /// Rejects wrong lengths, the zero scalar, and scalars at or above the
    /// curve order.
    pub fn from_hex(prv_hex: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(prv_hex.trim())?;
        if bytes.len() != 32 {
            return Err(IdentityError::InvalidLength(bytes.len()));
        }
        let signing_key =
            SigningKey::from_slice(&bytes).map_err(|_| IdentityError::InvalidScalar)?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let id = client_id_for_key(signing_key.verifying_key());
        Self { signing_key, id }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.id
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Uncompressed SEC1 public key bytes (65 bytes, `0x04 || X || Y`).
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Signs a 32-byte digest, returning the hex `r || s || recovery_id`
    /// form used everywhere in the tree.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<String, IdentityError> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(digest)
            .map_err(|_| IdentityError::SigningFailed)?;
        let mut out = signature.to_bytes().to_vec();
        out.push(recovery_id.to_byte());
        Ok(hex::encode(out))
    }
}

/// Recovers the signer's `ClientId` from a digest and a hex signature.
pub fn recover_client_id(digest: &[u8; 32], sig_hex: &str) -> Result<ClientId, IdentityError> {
    let bytes = hex::decode(sig_hex).map_err(|_| IdentityError::MalformedSignature)?;
    if bytes.len() != 65 {
        return Err(IdentityError::MalformedSignature);
    }
    let signature =
        Signature::from_slice(&bytes[..64]).map_err(|_| IdentityError::MalformedSignature)?;
    let recovery_id =
        RecoveryId::from_byte(bytes[64]).ok_or(IdentityError::MalformedSignature)?;
    let key = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
        .map_err(|_| IdentityError::RecoveryFailed)?;
    Ok(client_id_for_key(&key))
}

fn client_id_for_key(key: &VerifyingKey) -> ClientId {
    let pub_hex = hex::encode(key.to_encoded_point(false).as_bytes());
    sha3_hex(pub_hex.as_bytes())
}

/// Hex SHA3-256 digest of arbitrary bytes.
pub fn sha3_hex(data: &[u8]) -> String {
    hex::encode(Sha3_256::digest(data))
}

/// SHA3-256 digest as raw bytes.
pub fn sha3_digest(data: &[u8]) -> [u8; 32] {
    Sha3_256::digest(data).into()
}

/// Random content id: the hex SHA3-256 digest of a fresh UUID.
pub fn random_content_id() -> String {
    sha3_hex(Uuid::new_v4().to_string().as_bytes())
}

/// Fresh hex-encoded 32-byte signing nonce.
pub fn random_nonce() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
