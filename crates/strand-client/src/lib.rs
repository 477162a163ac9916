// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client core for the Strand hub.
//!
//! Keeps a promoted server baseline per (space, document), stacks
//! optimistic overlays for in-flight transactions on top of it, and
//! settles every commit with exactly one of three outcomes:
//!
//! - `Committed` — the server accepted it; the overlay folds into the
//!   baseline at the receipt's epoch (merging through the codec when a
//!   delivery already advanced the baseline past it)
//! - `Conflict` — the server rejected it; the overlay is dropped
//! - `Rejected` — decided locally, without a round-trip, because a
//!   delivery invalidated the transaction's read-set between open and
//!   commit
//!
//! Deliveries are applied to baselines in arrival (epoch) order and
//! acknowledged automatically, which advances the durable server-side
//! cursor. [`StrandClient::synced`] is the barrier callers await before
//! trusting reads: every subscription opened before the call has
//! completed its backfill and every commit submitted before the call has
//! settled.
//!
//! The transport is deliberately abstract — a [`Connection`] is one pair
//! of frame channels. `strand-server` adapts TCP sockets to it; tests run
//! it over in-memory pipes.

mod client;
mod transport;
mod tx;
mod view;

pub use client::{ChangeNotice, Connection, StrandClient, SubscriptionHandle, ViewSnapshot};
pub use tx::{CommitOutcome, Transaction};

use strand_proto::ErrorPayload;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Durable client identity, used for hello/resume cursors and as the
    /// consumer identity of subscriptions.
    pub client_id: String,
    /// Bearer token presented in every request envelope.
    pub access_token: String,
    /// How long to wait for any single `task/return`.
    pub op_timeout: std::time::Duration,
}

impl ClientConfig {
    /// Config with the shipped defaults for one client identity.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            access_token: String::new(),
            op_timeout: std::time::Duration::from_secs(30),
        }
    }
}

/// Errors surfaced by client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The connection to the hub is gone.
    #[error("transport closed")]
    TransportClosed,
    /// No `task/return` arrived within the configured timeout.
    #[error("request timed out")]
    Timeout,
    /// The hub answered with an error return.
    #[error("server error {code} {name}: {message}", code = .0.code, name = .0.name, message = .0.message)]
    Server(ErrorPayload),
    /// The hub answered with a frame the request cannot accept.
    #[error("unexpected return frame")]
    UnexpectedReturn,
    /// A delivered body did not decode.
    #[error("malformed delivery: {0}")]
    MalformedDelivery(String),
}
