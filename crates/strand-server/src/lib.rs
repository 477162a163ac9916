// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Strand storage hub server.
//!
//! Front end for the engine and fan-out hub: accepts framed-CBOR TCP
//! connections, authorizes each request through the [`auth::Authorizer`]
//! port, and dispatches the five `/storage/*` commands. Per connection,
//! one reader loop handles frames in arrival order and one writer task
//! drains the outbox — the outbox channel is the transport's
//! write-readiness signal, which the hub's delivery tasks use for
//! pause/resume.

pub mod auth;
pub mod service;

pub use auth::{AllowAll, AuthDecision, Authorizer, Capability, StaticTokens};
pub use service::{build_service, ServiceConfig, StorageService};
