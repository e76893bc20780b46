//! Sepal codec.
//!
//! The sepal is a row of `l1 + 1` nested-encrypted blocks: `d` key blocks on
//! the left, each wrapping the master key under layer keys `1 ..= l-1`, and
//! `l1 - d + 1` null blocks on the right wrapping a sentinel under layer keys
//! `1 ..= l1+1`.
//!
//! ```text
//! [ K K .. K | N N .. N ]      (l1 + 1 blocks)
//!   ^ bruise drops here    ^ normal mixer drops here
//! ```
//!
//! Every mixer peels one layer and drops one block, so after `l1` mixers a
//! single block survives. With `b` bruises it is block `b` of the original row:
//! a key block (the last gatekeeper reveals `K`) iff `b < d`.
//!
//! Null blocks are padded so that they are exactly as long as key blocks at
//! every depth a mixer can observe.

use std::collections::BTreeSet;

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, base64_bytes, digest, encode_b64, SymmetricKey, KEY_SIZE, LAYER_OVERHEAD};
use crate::error::{OnionError, OnionResult};

/// An onion that collects this many bruises is not expected to survive
/// past the mixer that dealt the last one.
pub const BRUISE_CUTOFF: usize = 3;

const NULL_MARKER: &[u8; 16] = b"sepal:null-block";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SepalBlock(#[serde(with = "base64_bytes")] Vec<u8>);

impl SepalBlock {
    /// Whether the block has been peeled down to the null sentinel.
    pub fn is_null(&self) -> bool {
        self.0.starts_with(NULL_MARKER)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn peel(&self, key: &SymmetricKey) -> OnionResult<SepalBlock> {
        if self.is_null() {
            return Ok(self.clone());
        }
        Ok(SepalBlock(crypto::decrypt(key, &self.0)?))
    }
}

impl std::fmt::Debug for SepalBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            f.write_str("SepalBlock(null)")
        } else {
            write!(f, "SepalBlock({} bytes)", self.0.len())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sepal {
    blocks: Vec<SepalBlock>,
}

impl Sepal {
    pub fn new(blocks: Vec<SepalBlock>) -> Self {
        Self { blocks }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[SepalBlock] {
        &self.blocks
    }

    /// Decrypt every block with the hop's layer key. Null blocks pass through.
    pub fn peel(&self, key: &SymmetricKey) -> OnionResult<Sepal> {
        let blocks = self
            .blocks
            .iter()
            .map(|block| block.peel(key))
            .collect::<OnionResult<Vec<_>>>()?;
        Ok(Sepal { blocks })
    }

    /// Drop the left-most block: this hop's checkpoint verification failed.
    pub fn add_bruise(mut self) -> Sepal {
        if !self.blocks.is_empty() {
            self.blocks.remove(0);
        }
        self
    }

    /// Drop the right-most block: the routine mixer step.
    pub fn remove_block(mut self) -> Sepal {
        self.blocks.pop();
        self
    }

    /// Digest compared against a mixer's verification set.
    pub fn digest(&self) -> String {
        let mut data = Vec::new();
        for block in &self.blocks {
            data.extend_from_slice(&(block.0.len() as u32).to_be_bytes());
            data.extend_from_slice(&block.0);
        }
        encode_b64(&digest(&data))
    }

    /// No block left can still yield the master key.
    pub fn is_exhausted(&self) -> bool {
        self.blocks.iter().all(SepalBlock::is_null)
    }

    /// The master key, once the last gatekeeper has peeled the surviving key block.
    pub fn master_key(&self) -> Option<SymmetricKey> {
        match self.blocks.as_slice() {
            [block] if !block.is_null() && block.0.len() == KEY_SIZE => {
                SymmetricKey::from_slice(&block.0).ok()
            }
            _ => None,
        }
    }
}

/// Everything the sender precomputes about the sepal of one onion.
#[derive(Debug, Clone)]
pub struct SepalMaterial {
    /// `table[depth][j]`: block `j` after `depth` peels.
    table: Vec<Vec<SepalBlock>>,
    l1: usize,
    /// `verification_hashes[i - 1]`: sorted valid digests for mixer `i`.
    pub verification_hashes: Vec<Vec<String>>,
}

/// Build the sepal for `l1` mixers and bruise tolerance `d`.
/// `layer_keys[i - 1]` is layer key `i`; at least one gatekeeper is required.
pub fn form_sepal<R: RngCore + CryptoRng>(
    layer_keys: &[SymmetricKey],
    master_key: &SymmetricKey,
    l1: usize,
    d: usize,
    rng: &mut R,
) -> OnionResult<SepalMaterial> {
    if d > l1 {
        return Err(OnionError::InvalidBruiseTolerance { d, l1 });
    }
    let l = layer_keys.len();
    if l < l1 + 2 {
        return Err(OnionError::ArityMismatch {
            what: "layer keys",
            expected: l1 + 2,
            actual: l,
        });
    }

    let key_depth = l - 1;
    let null_depth = l1 + 1;
    let null_plaintext = null_sentinel(KEY_SIZE + (key_depth - null_depth) * LAYER_OVERHEAD);

    let mut chains = Vec::with_capacity(l1 + 1);
    for _ in 0..d {
        chains.push(wrap_chain(master_key.as_bytes(), &layer_keys[..key_depth], key_depth, rng)?);
    }
    for _ in d..=l1 {
        chains.push(wrap_chain(&null_plaintext, &layer_keys[..null_depth], key_depth, rng)?);
    }

    let table = (0..=key_depth)
        .map(|depth| chains.iter().map(|chain| chain[depth].clone()).collect())
        .collect();

    let mut material = SepalMaterial {
        table,
        l1,
        verification_hashes: Vec::new(),
    };
    material.verification_hashes = material.enumerate_verification_hashes();
    Ok(material)
}

impl SepalMaterial {
    /// The sepal handed to the first hop.
    pub fn initial(&self) -> Sepal {
        self.shape(0, 0, 0)
    }

    /// Sepal after `depth` peels, `removed` drops of which `bruises` were bruises.
    pub fn shape(&self, depth: usize, bruises: usize, removed: usize) -> Sepal {
        let row = &self.table[depth.min(self.table.len() - 1)];
        let count = (self.l1 + 1).saturating_sub(removed);
        let end = (bruises + count).min(row.len());
        let start = bruises.min(end);
        Sepal {
            blocks: row[start..end].to_vec(),
        }
    }

    /// Every sepal hop `layer` may validly receive, indexed by prior bruises.
    /// Empty for layer 0, which is the path sentinel.
    pub fn variants(&self, layer: usize) -> Vec<Sepal> {
        if layer == 0 {
            return Vec::new();
        }
        let removed = (layer - 1).min(self.l1);
        (0..=removed.min(BRUISE_CUTOFF - 1))
            .map(|bruises| self.shape(layer - 1, bruises, removed))
            .collect()
    }

    /// Walks every bruise/no-bruise history a row of mixers can produce and
    /// records, per mixer, the digest of the peeled sepal it would hold.
    fn enumerate_verification_hashes(&self) -> Vec<Vec<String>> {
        let mut sets = vec![BTreeSet::new(); self.l1];
        self.walk(1, 0, &mut sets);
        sets.into_iter().map(|set| set.into_iter().collect()).collect()
    }

    fn walk(&self, position: usize, bruises: usize, sets: &mut [BTreeSet<String>]) {
        if position > self.l1 {
            return;
        }
        let received = self.shape(position, bruises, position - 1);
        sets[position - 1].insert(received.digest());

        self.walk(position + 1, bruises, sets);
        if bruises + 1 < BRUISE_CUTOFF {
            self.walk(position + 1, bruises + 1, sets);
        }
    }
}

fn null_sentinel(len: usize) -> Vec<u8> {
    let mut sentinel = NULL_MARKER.to_vec();
    sentinel.resize(len.max(NULL_MARKER.len()), 0);
    sentinel
}

/// `chain[depth]` for `depth` in `0..=max_depth`; once every key is used up
/// the plaintext repeats.
fn wrap_chain<R: RngCore + CryptoRng>(
    plaintext: &[u8],
    keys: &[SymmetricKey],
    max_depth: usize,
    rng: &mut R,
) -> OnionResult<Vec<SepalBlock>> {
    let mut chain = vec![SepalBlock(plaintext.to_vec()); max_depth + 1];
    let mut current = plaintext.to_vec();
    for (index, key) in keys.iter().enumerate().rev() {
        current = crypto::encrypt(key, &current, rng)?;
        chain[index] = SepalBlock(current.clone());
    }
    Ok(chain)
}
