//! Peeling engine.
//!
//! One call takes one layer off: the header yields the hop's role, layer and
//! layer key; the key then opens the content layer and the sepal. The sepal
//! is only peeled here, never narrowed; narrowing is the relay's decision.

use crate::crypto::{digest, encode_b64, KeyPair};
use crate::error::{OnionError, OnionResult};
use crate::onion::content::{open_message, peel_content, unwrap_master};
use crate::onion::header::decode_header;
use crate::onion::{Metadata, Onion, Role};

#[derive(Debug, Clone)]
pub enum PeeledPayload {
    /// Remainder for the next hop.
    Forward { next_hop: String, onion: Onion },
    /// The recipient recovered the message.
    Deliver { message: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct Peeled {
    pub role: Role,
    pub layer: usize,
    pub metadata: Metadata,
    /// Sepal digests this hop accepts; present for mixers.
    pub verification_hashes: Option<Vec<String>>,
    pub payload: PeeledPayload,
}

impl Peeled {
    /// Empty at the recipient.
    pub fn next_hop(&self) -> &str {
        match &self.payload {
            PeeledPayload::Forward { next_hop, .. } => next_hop,
            PeeledPayload::Deliver { .. } => "",
        }
    }
}

pub fn peel_onion(keys: &KeyPair, onion: &Onion) -> OnionResult<Peeled> {
    let decoded = decode_header(keys, &onion.header)?;

    let payload = match (decoded.next_hop, decoded.next_header) {
        (Some(next_hop), Some(header)) => {
            let content = peel_content(&decoded.key, &onion.content)?;
            check_tag(&decoded.tag, &content, decoded.layer)?;
            let sepal = onion.sepal.peel(&decoded.key)?;
            PeeledPayload::Forward {
                next_hop,
                onion: Onion { header, content, sepal },
            }
        }
        _ => {
            let master_key = onion.sepal.master_key().ok_or(OnionError::MasterKeyUnavailable)?;
            let inner = unwrap_master(&master_key, &onion.content)?;
            check_tag(&decoded.tag, &inner, decoded.layer)?;
            PeeledPayload::Deliver {
                message: open_message(&decoded.key, &inner)?,
            }
        }
    };

    Ok(Peeled {
        role: decoded.role,
        layer: decoded.layer,
        metadata: decoded.metadata,
        verification_hashes: decoded.verification_hashes,
        payload,
    })
}

fn check_tag(expected: &str, produced: &[u8], layer: usize) -> OnionResult<()> {
    if encode_b64(&digest(produced)) != expected {
        return Err(OnionError::TagMismatch { layer });
    }
    Ok(())
}
