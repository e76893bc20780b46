//! Relay processing.
//!
//! ```text
//! Received -> Verified | Bruised -> Forwarded | Delivered | Dropped
//! ```
//!
//! A relay peels each incoming onion with its static key, checks any
//! checkpoint nonce against the installed run, narrows the sepal when it is a
//! mixer, applies the bruise threshold when it is not, and hands the remainder
//! to the transport without waiting for the send. `receive` never fails: every
//! error ends as `Outcome::Dropped`.

pub mod intake;
pub mod run_state;
pub mod stats;
pub mod transport;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::crypto::{KeyPair, PublicKey};
use crate::error::{ConfigError, OnionError};
use crate::onion::{peel_onion, Metadata, Onion, Peeled, PeeledPayload, Role};

pub use run_state::RunState;
pub use stats::{LayerTally, RelayStats, StatsSnapshot};
pub use transport::{ChannelTransport, Envelope, Transport};
#[cfg(feature = "http_transport")]
pub use transport::HttpTransport;

/// Result of checking the onion's checkpoint nonce at this hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The nonce was in this layer's expected set.
    Checkpoint,
    /// A nonce was present but not expected here.
    Bruised,
    /// No nonce: ordinary traffic.
    Unchecked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    /// Not decodable or not peelable with this relay's key.
    Undecodable,
    /// A mixer received a sepal outside its verification set.
    SepalMismatch,
    /// A non-mixer observed more bruises than the run tolerates.
    BruiseThreshold,
}

impl std::fmt::Display for DropCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DropCause::Undecodable => "undecodable",
            DropCause::SepalMismatch => "sepal-mismatch",
            DropCause::BruiseThreshold => "bruise-threshold",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Forwarded {
        layer: usize,
        role: Role,
        next_hop: String,
        verification: Verification,
    },
    Delivered {
        layer: usize,
        verification: Verification,
    },
    Dropped {
        cause: DropCause,
    },
}

/// A message recovered by this relay acting as recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: String,
    pub layer: usize,
    pub metadata: Metadata,
    pub message: Vec<u8>,
}

pub struct Relay {
    address: String,
    keys: KeyPair,
    transport: Arc<dyn Transport>,
    run: watch::Sender<Option<Arc<RunState>>>,
    stats: Arc<RelayStats>,
    inbox: mpsc::UnboundedSender<Delivery>,
}

impl Relay {
    pub fn new(
        address: impl Into<String>,
        keys: KeyPair,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (run, _) = watch::channel(None);
        let (inbox, deliveries) = mpsc::unbounded_channel();
        let relay = Self {
            address: address.into(),
            keys,
            transport,
            run,
            stats: RelayStats::new(),
            inbox,
        };
        (relay, deliveries)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    /// Install a run. Receives in flight keep the run they started with;
    /// later receives see the new one in full. Counters are zeroed after
    /// the swap.
    pub fn start_run(&self, config: &RunConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let state = Arc::new(RunState::from_config(config));
        info!(
            run_id = %state.run_id,
            d = state.bruise_tolerance,
            max_bruises = state.max_bruises,
            expected = state.expected_count(),
            "run started"
        );
        self.run.send_replace(Some(state));
        // Receives still finishing on the previous run may land in the fresh
        // counters; the overlap is bounded by the onions in flight at swap.
        self.stats.reset();
        Ok(())
    }

    pub fn current_run(&self) -> Option<Arc<RunState>> {
        self.run.borrow().clone()
    }

    /// Process one envelope. Waits until a run has been installed.
    pub async fn receive(&self, envelope: Envelope) -> Outcome {
        let mut watcher = self.run.subscribe();
        let run = match watcher.wait_for(Option::is_some).await {
            Ok(run) => run.clone(),
            Err(_) => None,
        };
        match run {
            Some(run) => self.process(&run, envelope),
            None => self.drop_onion(DropCause::Undecodable),
        }
    }

    fn process(&self, run: &RunState, envelope: Envelope) -> Outcome {
        self.stats.onion_received();

        let peeled = match Onion::from_wire(&envelope.onion)
            .and_then(|onion| peel_onion(&self.keys, &onion))
        {
            Ok(peeled) => peeled,
            // The sepal lost every key block: at least `d` mixers bruised it.
            Err(OnionError::MasterKeyUnavailable) => {
                debug!(from = %envelope.from, "sepal withheld the master key");
                return self.drop_onion(DropCause::BruiseThreshold);
            }
            Err(err) => {
                warn!(from = %envelope.from, error = %err, "dropping onion");
                return self.drop_onion(DropCause::Undecodable);
            }
        };
        let Peeled {
            role,
            layer,
            metadata,
            verification_hashes,
            payload,
        } = peeled;

        if let (Role::Mixer, PeeledPayload::Forward { onion, .. }) = (role, &payload) {
            let digest = onion.sepal.digest();
            let valid = verification_hashes
                .as_ref()
                .is_some_and(|set| set.contains(&digest));
            if !valid {
                debug!(layer, "sepal outside verification set");
                return self.drop_onion(DropCause::SepalMismatch);
            }
        }

        let verification = match metadata.nonce.as_deref() {
            Some(nonce) if run.expects(layer, nonce) => {
                self.stats.checkpoint_matched(layer);
                Verification::Checkpoint
            }
            Some(_) => {
                self.stats.bruise_recorded(layer);
                Verification::Bruised
            }
            None => Verification::Unchecked,
        };
        let local_bruises = usize::from(verification == Verification::Bruised);

        match payload {
            PeeledPayload::Forward { next_hop, onion } => {
                let onion = if role.is_mixer() {
                    let sepal = match verification {
                        Verification::Bruised => onion.sepal.clone().add_bruise(),
                        Verification::Checkpoint | Verification::Unchecked => {
                            onion.sepal.clone().remove_block()
                        }
                    };
                    onion.with_sepal(sepal)
                } else {
                    // A sentinel-only sepal means at least `d` mixers bruised it.
                    let inherited = if onion.sepal.is_exhausted() {
                        run.bruise_tolerance
                    } else {
                        0
                    };
                    let bruises = local_bruises + inherited;
                    if bruises > run.max_bruises {
                        debug!(layer, bruises, "bruise threshold exceeded");
                        return self.drop_onion(DropCause::BruiseThreshold);
                    }
                    onion
                };
                self.forward(layer, role, next_hop, onion, verification)
            }
            PeeledPayload::Deliver { message } => {
                if local_bruises > run.max_bruises {
                    debug!(layer, "bruise threshold exceeded at recipient");
                    return self.drop_onion(DropCause::BruiseThreshold);
                }
                info!(layer, from = %envelope.from, bytes = message.len(), "message delivered");
                let delivery = Delivery {
                    from: envelope.from,
                    layer,
                    metadata,
                    message,
                };
                if self.inbox.send(delivery).is_err() {
                    debug!("inbox closed, delivery discarded");
                }
                self.stats.onion_delivered();
                Outcome::Delivered {
                    layer,
                    verification,
                }
            }
        }
    }

    fn forward(
        &self,
        layer: usize,
        role: Role,
        next_hop: String,
        onion: Onion,
        verification: Verification,
    ) -> Outcome {
        let wire = match onion.to_wire() {
            Ok(wire) => wire,
            Err(err) => {
                warn!(layer, error = %err, "cannot encode remainder");
                return self.drop_onion(DropCause::Undecodable);
            }
        };
        let envelope = Envelope {
            to: next_hop.clone(),
            from: self.address.clone(),
            onion: wire,
        };

        let transport = Arc::clone(&self.transport);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            let to = envelope.to.clone();
            if let Err(err) = transport.send(envelope).await {
                stats.forward_failed();
                warn!(%to, error = %err, "forward failed");
            }
        });

        self.stats.onion_forwarded();
        debug!(layer, %role, %next_hop, ?verification, "forwarded");
        Outcome::Forwarded {
            layer,
            role,
            next_hop,
            verification,
        }
    }

    fn drop_onion(&self, cause: DropCause) -> Outcome {
        self.stats.onion_dropped(cause);
        Outcome::Dropped { cause }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("address", &self.address)
            .field("keys", &self.keys)
            .finish()
    }
}
