//! Content layer codec.
//!
//! The padded message is sealed under layer key `l`, then under the master
//! key, then under layer keys `l-1 .. 1`. Hop `i` removes one layer with key
//! `i`; only a party holding the master key can take the last two off.

use rand::{CryptoRng, RngCore};

use crate::crypto::{self, SymmetricKey};
use crate::error::{OnionError, OnionResult};

/// Fixed size every message is padded to before encryption.
pub const PADDED_MESSAGE_SIZE: usize = 1024;

const LENGTH_PREFIX_SIZE: usize = 4;

pub const MAX_MESSAGE_SIZE: usize = PADDED_MESSAGE_SIZE - LENGTH_PREFIX_SIZE;

/// All content layers of one onion.
#[derive(Debug, Clone)]
pub struct FormedContent {
    /// `layers[i - 1]` is what hop `i` receives.
    pub layers: Vec<Vec<u8>>,
    /// Message sealed under layer key `l` only, before the master wrap.
    pub inner: Vec<u8>,
}

/// Length prefix, message, zero fill up to `PADDED_MESSAGE_SIZE`.
pub fn pad(message: &[u8]) -> OnionResult<Vec<u8>> {
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(OnionError::MessageTooLong {
            len: message.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut padded = Vec::with_capacity(PADDED_MESSAGE_SIZE);
    padded.extend_from_slice(&(message.len() as u32).to_be_bytes());
    padded.extend_from_slice(message);
    padded.resize(PADDED_MESSAGE_SIZE, 0);
    Ok(padded)
}

pub fn unpad(padded: &[u8]) -> OnionResult<Vec<u8>> {
    if padded.len() < LENGTH_PREFIX_SIZE {
        return Err(OnionError::MalformedOnion("padded message too short".into()));
    }
    let (prefix, body) = padded.split_at(LENGTH_PREFIX_SIZE);
    let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
    len_bytes.copy_from_slice(prefix);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > body.len() {
        return Err(OnionError::MalformedOnion(format!(
            "length prefix claims {len} bytes, {} available",
            body.len()
        )));
    }
    Ok(body[..len].to_vec())
}

/// `layer_keys[i - 1]` is layer key `i`; there must be at least one.
pub fn form_content<R: RngCore + CryptoRng>(
    message: &[u8],
    layer_keys: &[SymmetricKey],
    master_key: &SymmetricKey,
    rng: &mut R,
) -> OnionResult<FormedContent> {
    let (last_key, outer_keys) = layer_keys.split_last().ok_or(OnionError::ArityMismatch {
        what: "layer keys",
        expected: 1,
        actual: 0,
    })?;

    let inner = crypto::encrypt(last_key, &pad(message)?, rng)?;
    let mut current = crypto::encrypt(master_key, &inner, rng)?;

    let mut layers = Vec::with_capacity(layer_keys.len());
    layers.push(current.clone());
    for key in outer_keys.iter().rev() {
        current = crypto::encrypt(key, &current, rng)?;
        layers.push(current.clone());
    }
    layers.reverse();

    Ok(FormedContent { layers, inner })
}

/// Remove one layer.
pub fn peel_content(key: &SymmetricKey, content: &[u8]) -> OnionResult<Vec<u8>> {
    Ok(crypto::decrypt(key, content)?)
}

/// Take the master wrap off the recipient's content layer.
pub fn unwrap_master(master_key: &SymmetricKey, content: &[u8]) -> OnionResult<Vec<u8>> {
    Ok(crypto::decrypt(master_key, content)?)
}

/// Recover the message from the inner ciphertext with layer key `l`.
pub fn open_message(last_key: &SymmetricKey, inner: &[u8]) -> OnionResult<Vec<u8>> {
    unpad(&crypto::decrypt(last_key, inner)?)
}
