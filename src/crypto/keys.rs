//! Ed25519 keypairs, signing and verification.
//!
//! An address is the base58 encoding of the 32-byte public key, so the
//! account identity and the verification key are the same value.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use super::{base58, CryptoError};

/// A base58-encoded Ed25519 keypair
#[derive(Clone)]
pub struct Keypair {
    /// Public key, doubles as the account address
    pub public_key: String,
    /// 32-byte secret seed
    pub private_key: String,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG
    pub fn generate() -> Self {
        Self::from_signing_key(&SigningKey::generate(&mut OsRng))
    }

    /// Deterministic keypair from a seed (tests and fixtures)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(&SigningKey::from_bytes(seed))
    }

    fn from_signing_key(signing_key: &SigningKey) -> Self {
        Self {
            public_key: base58::encode(signing_key.verifying_key().as_bytes()),
            private_key: base58::encode(&signing_key.to_bytes()),
        }
    }

    pub fn address(&self) -> &str {
        &self.public_key
    }

    /// Sign `message` with this keypair's private key
    pub fn sign(&self, message: &[u8]) -> Result<String, CryptoError> {
        sign(message, &self.private_key)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Generate a new keypair
pub fn generate_keypair() -> Keypair {
    Keypair::generate()
}

fn signing_key(private_key: &str) -> Result<SigningKey, CryptoError> {
    let seed = base58::decode_array::<32>(private_key)?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Public key (address) for a base58 private key
pub fn derive_public_key(private_key: &str) -> Result<String, CryptoError> {
    let key = signing_key(private_key)?;
    Ok(base58::encode(key.verifying_key().as_bytes()))
}

/// Sign a message, returning the base58 signature
pub fn sign(message: &[u8], private_key: &str) -> Result<String, CryptoError> {
    let key = signing_key(private_key)?;
    let signature: Signature = key.sign(message);
    Ok(base58::encode(&signature.to_bytes()))
}

/// Verify a base58 signature against a base58 public key.
///
/// Never fails loudly: malformed encodings, wrong lengths and invalid curve
/// points all yield `false`.
pub fn verify(message: &[u8], signature: &str, public_key: &str) -> bool {
    let Ok(key_bytes) = base58::decode_array::<32>(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = base58::decode_array::<64>(signature) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(message, &signature).is_ok()
}

/// True when `address` decodes to a valid Ed25519 public key
pub fn is_valid_address(address: &str) -> bool {
    base58::decode_array::<32>(address)
        .map(|bytes| VerifyingKey::from_bytes(&bytes).is_ok())
        .unwrap_or(false)
}
