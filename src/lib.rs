//! Accountable onion routing with sepal-based bruise detection.
//!
//! `onion` builds and peels onions without side effects; `relay` runs the
//! per-hop state machine on top of it.

pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod onion;
pub mod relay;

#[cfg(test)]
mod relay_tests;

pub use config::{ExpectedNonce, RelayConfig, RunConfig};
pub use crypto::{KeyPair, SymmetricKey};
pub use error::{ConfigError, CryptoError, OnionError, TransportError};
pub use onion::{form_onion, peel_onion, Metadata, Onion, OnionRequest, Path, Role};
pub use relay::{DropCause, Envelope, Outcome, Relay, Transport, Verification};
