//! Primitive crypto adapter.
//!
//! Symmetric layers are AES-256-GCM with a fresh random 96-bit IV prepended to
//! every ciphertext. Per-hop secrets come from X25519 agreement between a
//! one-time ephemeral key and the hop's static key, hashed with SHA-256.
//!
//! ```text
//! ciphertext = IV[12] || AES-256-GCM(key, IV, plaintext) || TAG[16]
//! hop key    = SHA-256("sepal-onion:hop-key:v1" || X25519(eph, static))
//! ```
//!
//! Every function here is pure apart from the random generator it is given.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, StaticSecret};

pub use x25519_dalek::PublicKey;

use crate::error::{CryptoError, CryptoResult};

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;
pub const AUTH_TAG_SIZE: usize = 16;

/// Bytes added by one symmetric layer.
pub const LAYER_OVERHEAD: usize = IV_SIZE + AUTH_TAG_SIZE;

const HOP_KEY_DOMAIN: &[u8] = b"sepal-onion:hop-key:v1";

/// A 256-bit symmetric key: a layer key, a hop key or the master key.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let array: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

impl Serialize for SymmetricKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode_b64(&self.0))
    }
}

impl<'de> Deserialize<'de> for SymmetricKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = base64_bytes::deserialize(deserializer)?;
        SymmetricKey::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Encrypt under `key` with a random IV drawn from `rng`.
pub fn encrypt<R: RngCore + CryptoRng>(
    key: &SymmetricKey,
    plaintext: &[u8],
    rng: &mut R,
) -> CryptoResult<Vec<u8>> {
    let mut iv = [0u8; IV_SIZE];
    rng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(IV_SIZE + sealed.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn decrypt(key: &SymmetricKey, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() < LAYER_OVERHEAD {
        return Err(CryptoError::CiphertextTooShort {
            len: ciphertext.len(),
            min: LAYER_OVERHEAD,
        });
    }
    let (iv, sealed) = ciphertext.split_at(IV_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(iv), sealed)
        .map_err(|_| CryptoError::Decryption)
}

/// Long-term X25519 identity of a relay or client.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(&mut *rng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Hop key shared with whoever generated `ephemeral`.
    pub fn shared_key(&self, ephemeral: &PublicKey) -> CryptoResult<SymmetricKey> {
        let shared = self.secret.diffie_hellman(ephemeral);
        if !shared.was_contributory() {
            return Err(CryptoError::KeyAgreement);
        }
        Ok(hop_key(shared.as_bytes()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &encode_b64(self.public.as_bytes()))
            .finish()
    }
}

/// Fresh ephemeral agreement with `peer`: returns the ephemeral public key to
/// publish and the hop key only `peer` can recompute.
pub fn ephemeral_shared_key<R: RngCore + CryptoRng>(
    peer: &PublicKey,
    rng: &mut R,
) -> CryptoResult<(PublicKey, SymmetricKey)> {
    let secret = EphemeralSecret::random_from_rng(&mut *rng);
    let public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(peer);
    if !shared.was_contributory() {
        return Err(CryptoError::KeyAgreement);
    }
    Ok((public, hop_key(shared.as_bytes())))
}

fn hop_key(shared: &[u8; 32]) -> SymmetricKey {
    let mut hasher = Sha256::new();
    hasher.update(HOP_KEY_DOMAIN);
    hasher.update(shared);
    SymmetricKey(hasher.finalize().into())
}

pub fn digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Random checkpoint nonce, base64 encoded.
pub fn new_nonce<R: RngCore + CryptoRng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    encode_b64(&bytes)
}

pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_b64(text: &str) -> CryptoResult<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| CryptoError::Base64(e.to_string()))
}

pub fn public_key_from_b64(text: &str) -> CryptoResult<PublicKey> {
    let bytes = decode_b64(text)?;
    let array: [u8; KEY_SIZE] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })?;
    Ok(PublicKey::from(array))
}

/// Serde adapter storing byte vectors as base64 strings.
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode_b64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::decode_b64(&text).map_err(serde::de::Error::custom)
    }
}
