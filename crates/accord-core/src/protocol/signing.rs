//! Party identity: terms signing and sealed message envelopes.
//!
//! Each party carries two keys. The *signing* key (ed25519) binds the
//! party to the agreement terms; its lowercase-hex public key is the
//! "address" exchanged in replies and recorded on the anchor. The
//! *mailbox* key (x25519) is published to the directory and used by
//! counter parties to seal protocol messages so only the recipient can
//! read them: an ephemeral ECDH agreement keyed into AES-256-GCM.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// Byte length of the GCM nonce.
const NONCE_LEN: usize = 12;

/// Errors from signing, verification, and envelope handling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    /// An address or signature was not valid hex of the right length.
    #[error("malformed {what}: {reason}")]
    Malformed {
        /// Which input was malformed.
        what: &'static str,
        /// Diagnostic.
        reason: String,
    },

    /// A sealed envelope could not be opened.
    #[error("envelope cannot be opened: wrong recipient or corrupt payload")]
    OpenFailed,
}

/// The party's long-lived key material.
pub struct PartyKey {
    signing: SigningKey,
    mailbox: StaticSecret,
}

impl PartyKey {
    /// Generates a fresh identity.
    #[must_use]
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self {
            signing: SigningKey::from_bytes(&secret),
            mailbox: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restores an identity from stored key bytes.
    #[must_use]
    pub fn from_bytes(signing: &[u8; 32], mailbox: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(signing),
            mailbox: StaticSecret::from(mailbox),
        }
    }

    /// The signing secret, for persistence.
    #[must_use]
    pub fn signing_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The mailbox secret, for persistence.
    #[must_use]
    pub fn mailbox_bytes(&self) -> [u8; 32] {
        self.mailbox.to_bytes()
    }

    /// The party's address: lowercase-hex ed25519 public key.
    #[must_use]
    pub fn address(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    /// The public mailbox key published to the directory.
    #[must_use]
    pub fn mailbox_public(&self) -> [u8; 32] {
        PublicKey::from(&self.mailbox).to_bytes()
    }

    /// Signs a lowercase-hex terms hash, returning a lowercase-hex
    /// signature.
    #[must_use]
    pub fn sign_hash(&self, hash_hex: &str) -> String {
        let sig = self.signing.sign(hash_hex.as_bytes());
        hex::encode(sig.to_bytes())
    }

    /// Opens an envelope sealed to this party's mailbox key.
    ///
    /// # Errors
    ///
    /// [`CryptoError::OpenFailed`] when the envelope was sealed to a
    /// different key or was tampered with.
    pub fn open(&self, envelope: &SealedEnvelope) -> Result<Vec<u8>, CryptoError> {
        let eph_pub = decode_key32("ephemeralKey", &envelope.ephemeral_key)?;
        let nonce = hex::decode(&envelope.nonce).map_err(|e| CryptoError::Malformed {
            what: "nonce",
            reason: e.to_string(),
        })?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::Malformed {
                what: "nonce",
                reason: format!("expected {NONCE_LEN} bytes"),
            });
        }
        let ciphertext = hex::decode(&envelope.ciphertext).map_err(|e| CryptoError::Malformed {
            what: "ciphertext",
            reason: e.to_string(),
        })?;

        let shared = self.mailbox.diffie_hellman(&PublicKey::from(eph_pub));
        let key = derive_key(shared.as_bytes(), &eph_pub, &self.mailbox_public());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| CryptoError::OpenFailed)
    }
}

impl std::fmt::Debug for PartyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartyKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// A protocol message sealed to a recipient's mailbox key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedEnvelope {
    /// Sender's ephemeral x25519 public key, hex.
    pub ephemeral_key: String,
    /// GCM nonce, hex.
    pub nonce: String,
    /// Ciphertext, hex.
    pub ciphertext: String,
}

impl SealedEnvelope {
    /// Seals plaintext to a recipient's published mailbox key.
    pub fn seal(recipient_mailbox: &[u8; 32], plaintext: &[u8]) -> Self {
        let eph = EphemeralSecret::random_from_rng(OsRng);
        let eph_pub = PublicKey::from(&eph).to_bytes();
        let shared = eph.diffie_hellman(&PublicKey::from(*recipient_mailbox));
        let key = derive_key(shared.as_bytes(), &eph_pub, recipient_mailbox);

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        // Encryption of in-memory data cannot fail with a valid key/nonce.
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .unwrap_or_default();

        Self {
            ephemeral_key: hex::encode(eph_pub),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        }
    }
}

/// Verifies a signature over a lowercase-hex terms hash against an
/// address.
///
/// # Errors
///
/// [`CryptoError::Malformed`] when the address or signature is not valid
/// hex of the right length. A well-formed but wrong signature returns
/// `Ok(false)`.
pub fn verify_hash(address: &str, hash_hex: &str, signature_hex: &str) -> Result<bool, CryptoError> {
    let key_bytes = decode_key32("address", address)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|e| CryptoError::Malformed {
        what: "address",
        reason: e.to_string(),
    })?;
    let sig_bytes = hex::decode(signature_hex).map_err(|e| CryptoError::Malformed {
        what: "signature",
        reason: e.to_string(),
    })?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|e| CryptoError::Malformed {
        what: "signature",
        reason: e.to_string(),
    })?;
    Ok(key.verify(hash_hex.as_bytes(), &sig).is_ok())
}

/// Generates a fresh 128-bit agreement id, lowercase hex.
#[must_use]
pub fn new_agreement_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn derive_key(shared: &[u8; 32], eph_pub: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(eph_pub);
    hasher.update(recipient);
    hasher.finalize().into()
}

fn decode_key32(what: &'static str, hex_str: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|e| CryptoError::Malformed {
        what,
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|_| CryptoError::Malformed {
        what,
        reason: "expected 32 bytes".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::terms_hash;

    #[test]
    fn test_sign_and_verify_terms_hash() {
        let key = PartyKey::generate();
        let hash = terms_hash(r#"{"a":1}"#);
        let sig = key.sign_hash(&hash);
        assert!(verify_hash(&key.address(), &hash, &sig).unwrap());

        // Any other hash must fail verification.
        let other = terms_hash(r#"{"a":2}"#);
        assert!(!verify_hash(&key.address(), &other, &sig).unwrap());
    }

    #[test]
    fn test_verify_rejects_malformed_inputs() {
        let key = PartyKey::generate();
        let hash = terms_hash("{}");
        let sig = key.sign_hash(&hash);
        assert!(verify_hash("zz", &hash, &sig).is_err());
        assert!(verify_hash(&key.address(), &hash, "nothex").is_err());
    }

    #[test]
    fn test_envelope_round_trip() {
        let recipient = PartyKey::generate();
        let sealed = SealedEnvelope::seal(&recipient.mailbox_public(), b"hello node");
        assert_eq!(recipient.open(&sealed).unwrap(), b"hello node");
    }

    #[test]
    fn test_envelope_wrong_recipient() {
        let recipient = PartyKey::generate();
        let eavesdropper = PartyKey::generate();
        let sealed = SealedEnvelope::seal(&recipient.mailbox_public(), b"secret");
        assert!(matches!(
            eavesdropper.open(&sealed),
            Err(CryptoError::OpenFailed)
        ));
    }

    #[test]
    fn test_agreement_id_shape() {
        let id = new_agreement_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, new_agreement_id());
    }

    #[test]
    fn test_identity_round_trips_through_bytes() {
        let key = PartyKey::generate();
        let restored = PartyKey::from_bytes(&key.signing_bytes(), key.mailbox_bytes());
        assert_eq!(key.address(), restored.address());
        assert_eq!(key.mailbox_public(), restored.mailbox_public());
    }
}
