//! Sepal-bearing onions.
//!
//! An onion travels `mixers -> gatekeepers -> recipient`. Each hop learns its
//! role, its layer index and its layer key from its own header, peels one
//! layer of content, and peels (mixers also narrow) the sepal.
//!
//! ```text
//! layer:   1 .. l1 | l1+1 .. l-1          | l
//! role:    MIXER   | GATEKEEPER .. LAST_GK | RECIPIENT
//! sepal:   -1 each | count preserved       | reveals K
//! ```

pub mod assemble;
pub mod content;
pub mod header;
pub mod peel;
pub mod sepal;

use serde::{Deserialize, Serialize};

use crate::crypto::{base64_bytes, decode_b64, encode_b64};
use crate::error::{OnionError, OnionResult};

pub use assemble::{form_onion, FormedOnion, OnionLayer, OnionRequest};
pub use header::Header;
pub use peel::{peel_onion, Peeled, PeeledPayload};
pub use sepal::Sepal;

/// Position-derived role of a hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Mixer,
    Gatekeeper,
    LastGatekeeper,
    /// Implicit: never written into a header.
    Recipient,
}

impl Role {
    /// Role of the hop at 1-based `layer` on a path with `l1` mixers and `l` layers.
    pub fn at(layer: usize, l1: usize, l: usize) -> Role {
        if layer <= l1 {
            Role::Mixer
        } else if layer + 1 < l {
            Role::Gatekeeper
        } else if layer + 1 == l {
            Role::LastGatekeeper
        } else {
            Role::Recipient
        }
    }

    pub fn is_mixer(self) -> bool {
        self == Role::Mixer
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Mixer => "mixer",
            Role::Gatekeeper => "gatekeeper",
            Role::LastGatekeeper => "last-gatekeeper",
            Role::Recipient => "recipient",
        };
        f.write_str(name)
    }
}

/// Per-hop metadata sealed inside the hop's header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Checkpoint nonce this hop should find in its expected set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub example: String,
}

impl Metadata {
    pub fn with_nonce(nonce: impl Into<String>) -> Self {
        Self {
            nonce: Some(nonce.into()),
            ..Self::default()
        }
    }

    pub fn with_example(example: impl Into<String>) -> Self {
        Self {
            example: example.into(),
            ..Self::default()
        }
    }
}

/// Ordered hop addresses. Index 0 is an empty sentinel so that hop `i`
/// lives at index `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    hops: Vec<String>,
    l1: usize,
}

impl Path {
    pub fn new(mixers: Vec<String>, gatekeepers: Vec<String>, recipient: String) -> OnionResult<Self> {
        if gatekeepers.is_empty() {
            return Err(OnionError::InvalidPath(
                "at least one gatekeeper is required".into(),
            ));
        }
        let l1 = mixers.len();
        let mut hops = Vec::with_capacity(mixers.len() + gatekeepers.len() + 2);
        hops.push(String::new());
        hops.extend(mixers);
        hops.extend(gatekeepers);
        hops.push(recipient);
        if hops[1..].iter().any(|hop| hop.is_empty()) {
            return Err(OnionError::InvalidPath("empty hop address".into()));
        }
        Ok(Self { hops, l1 })
    }

    /// Number of mixers.
    pub fn l1(&self) -> usize {
        self.l1
    }

    /// Number of gatekeepers, the last gatekeeper included.
    pub fn l2(&self) -> usize {
        self.len() - self.l1 - 1
    }

    /// Number of layers, `l1 + l2 + 1`.
    pub fn len(&self) -> usize {
        self.hops.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address of hop `layer` (1-based); the sentinel for 0 and beyond the end.
    pub fn hop(&self, layer: usize) -> &str {
        self.hops.get(layer).map(String::as_str).unwrap_or("")
    }

    pub fn role(&self, layer: usize) -> Role {
        Role::at(layer, self.l1, self.len())
    }

    /// All entries, sentinel included.
    pub fn hops(&self) -> &[String] {
        &self.hops
    }
}

/// What one hop receives: its header, its content layer and the sepal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Onion {
    pub header: Header,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub sepal: Sepal,
}

impl Onion {
    /// Base64 of the JSON form, as carried in a transport envelope.
    pub fn to_wire(&self) -> OnionResult<String> {
        let json = serde_json::to_vec(self).map_err(|e| OnionError::MalformedOnion(e.to_string()))?;
        Ok(encode_b64(&json))
    }

    pub fn from_wire(wire: &str) -> OnionResult<Self> {
        let json = decode_b64(wire).map_err(|e| OnionError::MalformedOnion(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| OnionError::MalformedOnion(e.to_string()))
    }

    /// Same onion carrying a different sepal.
    pub fn with_sepal(self, sepal: Sepal) -> Self {
        Self { sepal, ..self }
    }
}
