//! Header chain codec.
//!
//! Header `i` holds a ciphertext only hop `i` can open (ephemeral X25519 with
//! the hop's static key) and, for `i < l`, header `i + 1` plus the address of
//! hop `i + 1` sealed under layer key `i`. Opening one header therefore gives
//! the hop exactly its own layer key and the next header, nothing deeper.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::crypto::{
    self, decode_b64, encode_b64, ephemeral_shared_key, public_key_from_b64, KeyPair, PublicKey,
    SymmetricKey,
};
use crate::error::{OnionError, OnionResult};
use crate::onion::{Metadata, Path, Role};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub ephemeral_public_key: String,
    pub encrypted_ciphertext: String,
    /// Valid sepal digests for this position; mixers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_hashes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_next_header: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct HeaderPayload {
    tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
    layer: usize,
    key: SymmetricKey,
    metadata: Metadata,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextHeader {
    next_hop: String,
    header: Header,
}

/// Everything needed to build the chain. Slices are indexed by `layer - 1`.
pub struct HeaderInputs<'a> {
    pub path: &'a Path,
    pub public_keys: &'a [PublicKey],
    pub layer_keys: &'a [SymmetricKey],
    pub metadata: &'a [Metadata],
    pub tags: &'a [String],
    /// One set per mixer position.
    pub verification_hashes: &'a [Vec<String>],
}

/// Header of one hop after opening it.
#[derive(Debug, Clone)]
pub struct DecodedHeader {
    pub tag: String,
    pub role: Role,
    pub layer: usize,
    pub key: SymmetricKey,
    pub metadata: Metadata,
    pub verification_hashes: Option<Vec<String>>,
    pub next_hop: Option<String>,
    pub next_header: Option<Header>,
}

/// Build headers innermost first. Returns them indexed by `layer - 1`.
pub fn form_headers<R: RngCore + CryptoRng>(
    inputs: &HeaderInputs<'_>,
    rng: &mut R,
) -> OnionResult<Vec<Header>> {
    let path = inputs.path;
    let l = path.len();
    check_arity("public keys", l, inputs.public_keys.len())?;
    check_arity("layer keys", l, inputs.layer_keys.len())?;
    check_arity("metadata entries", l, inputs.metadata.len())?;
    check_arity("tags", l, inputs.tags.len())?;
    check_arity("verification sets", path.l1(), inputs.verification_hashes.len())?;

    let mut headers: Vec<Header> = Vec::with_capacity(l);
    for layer in (1..=l).rev() {
        let role = path.role(layer);
        let payload = HeaderPayload {
            tag: inputs.tags[layer - 1].clone(),
            role: (role != Role::Recipient).then_some(role),
            layer,
            key: inputs.layer_keys[layer - 1].clone(),
            metadata: inputs.metadata[layer - 1].clone(),
        };
        let plaintext = to_json(&payload)?;
        let (ephemeral, hop_key) = ephemeral_shared_key(&inputs.public_keys[layer - 1], rng)?;
        let encrypted_ciphertext = encode_b64(&crypto::encrypt(&hop_key, &plaintext, rng)?);

        let encrypted_next_header = match headers.last() {
            Some(inner) => {
                let next = NextHeader {
                    next_hop: path.hop(layer + 1).to_string(),
                    header: inner.clone(),
                };
                let sealed = crypto::encrypt(&inputs.layer_keys[layer - 1], &to_json(&next)?, rng)?;
                Some(encode_b64(&sealed))
            }
            None => None,
        };

        let verification_hashes = (layer <= path.l1())
            .then(|| inputs.verification_hashes[layer - 1].clone());

        headers.push(Header {
            ephemeral_public_key: encode_b64(ephemeral.as_bytes()),
            encrypted_ciphertext,
            verification_hashes,
            encrypted_next_header,
        });
    }

    headers.reverse();
    Ok(headers)
}

/// Open `header` with the hop's static key.
pub fn decode_header(keys: &KeyPair, header: &Header) -> OnionResult<DecodedHeader> {
    let ephemeral = public_key_from_b64(&header.ephemeral_public_key)
        .map_err(|e| OnionError::MalformedHeader(format!("ephemeral key: {e}")))?;
    let hop_key = keys.shared_key(&ephemeral)?;

    let sealed = decode_b64(&header.encrypted_ciphertext)
        .map_err(|e| OnionError::MalformedHeader(format!("ciphertext: {e}")))?;
    let plaintext = crypto::decrypt(&hop_key, &sealed)?;
    let payload: HeaderPayload = serde_json::from_slice(&plaintext)
        .map_err(|e| OnionError::MalformedHeader(e.to_string()))?;

    if payload.layer == 0 {
        return Err(OnionError::MalformedHeader("layer 0 is the path sentinel".into()));
    }
    let role = payload.role.unwrap_or(Role::Recipient);

    let (next_hop, next_header) = match &header.encrypted_next_header {
        Some(encoded) => {
            let sealed = decode_b64(encoded)
                .map_err(|e| OnionError::MalformedHeader(format!("next header: {e}")))?;
            let plaintext = crypto::decrypt(&payload.key, &sealed)?;
            let next: NextHeader = serde_json::from_slice(&plaintext)
                .map_err(|e| OnionError::MalformedHeader(e.to_string()))?;
            (Some(next.next_hop), Some(next.header))
        }
        None => (None, None),
    };

    match (role, next_header.is_some()) {
        (Role::Recipient, true) => {
            return Err(OnionError::MalformedHeader("recipient header carries a next hop".into()))
        }
        (Role::Recipient, false) | (_, true) => {}
        (_, false) => {
            return Err(OnionError::MalformedHeader(format!("{role} header has no next hop")))
        }
    }

    Ok(DecodedHeader {
        tag: payload.tag,
        role,
        layer: payload.layer,
        key: payload.key,
        metadata: payload.metadata,
        verification_hashes: header.verification_hashes.clone(),
        next_hop,
        next_header,
    })
}

fn check_arity(what: &'static str, expected: usize, actual: usize) -> OnionResult<()> {
    if expected != actual {
        return Err(OnionError::ArityMismatch { what, expected, actual });
    }
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> OnionResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| OnionError::MalformedHeader(e.to_string()))
}
