//! Onion assembler.
//!
//! Generates the master key and one layer key per hop, then builds the sepal,
//! the content layers and the header chain, in that order, and zips them into
//! one onion per layer. A layer may admit several valid sepals (one per prior
//! bruise count) so each layer carries a small family of variants.

use rand::{CryptoRng, RngCore};

use crate::crypto::{digest, encode_b64, PublicKey, SymmetricKey};
use crate::error::{OnionError, OnionResult};
use crate::onion::content::form_content;
use crate::onion::header::{form_headers, HeaderInputs};
use crate::onion::sepal::form_sepal;
use crate::onion::{Metadata, Onion, Path};

/// Inputs to [`form_onion`]. `public_keys` and `metadata` are indexed by `layer - 1`.
#[derive(Debug, Clone, Copy)]
pub struct OnionRequest<'a> {
    pub message: &'a [u8],
    pub path: &'a Path,
    pub public_keys: &'a [PublicKey],
    pub metadata: &'a [Metadata],
    pub bruise_tolerance: usize,
}

#[derive(Debug, Clone)]
pub struct OnionLayer {
    pub layer: usize,
    /// `variants[b]` is what the hop receives after `b` earlier bruises.
    pub variants: Vec<Onion>,
}

impl OnionLayer {
    /// The variant for an unbruised history.
    pub fn unbruised(&self) -> Option<&Onion> {
        self.variants.first()
    }
}

#[derive(Debug, Clone)]
pub struct FormedOnion {
    layers: Vec<OnionLayer>,
}

impl FormedOnion {
    /// The onion to hand to hop 1.
    pub fn first(&self) -> Option<&Onion> {
        self.layers.first().and_then(OnionLayer::unbruised)
    }

    /// Layer `layer` (1-based).
    pub fn layer(&self, layer: usize) -> Option<&OnionLayer> {
        layer.checked_sub(1).and_then(|index| self.layers.get(index))
    }

    pub fn layers(&self) -> &[OnionLayer] {
        &self.layers
    }
}

pub fn form_onion<R: RngCore + CryptoRng>(
    request: &OnionRequest<'_>,
    rng: &mut R,
) -> OnionResult<FormedOnion> {
    let path = request.path;
    let l = path.len();
    if request.public_keys.len() != l {
        return Err(OnionError::ArityMismatch {
            what: "public keys",
            expected: l,
            actual: request.public_keys.len(),
        });
    }
    if request.metadata.len() != l {
        return Err(OnionError::ArityMismatch {
            what: "metadata entries",
            expected: l,
            actual: request.metadata.len(),
        });
    }

    let master_key = SymmetricKey::generate(rng);
    let layer_keys: Vec<SymmetricKey> = (0..l).map(|_| SymmetricKey::generate(rng)).collect();

    let sepal = form_sepal(&layer_keys, &master_key, path.l1(), request.bruise_tolerance, rng)?;
    let content = form_content(request.message, &layer_keys, &master_key, rng)?;

    // Hop i checks its tag against what it produces: content i+1, or for the
    // recipient the inner ciphertext under the master wrap.
    let tags: Vec<String> = (1..=l)
        .map(|layer| match content.layers.get(layer) {
            Some(next) => encode_b64(&digest(next)),
            None => encode_b64(&digest(&content.inner)),
        })
        .collect();

    let headers = form_headers(
        &HeaderInputs {
            path,
            public_keys: request.public_keys,
            layer_keys: &layer_keys,
            metadata: request.metadata,
            tags: &tags,
            verification_hashes: &sepal.verification_hashes,
        },
        rng,
    )?;

    let layers = headers
        .into_iter()
        .zip(content.layers)
        .enumerate()
        .map(|(index, (header, content))| {
            let layer = index + 1;
            let variants = sepal
                .variants(layer)
                .into_iter()
                .map(|sepal| Onion {
                    header: header.clone(),
                    content: content.clone(),
                    sepal,
                })
                .collect();
            OnionLayer { layer, variants }
        })
        .collect();

    Ok(FormedOnion { layers })
}
