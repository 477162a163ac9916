// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Authorization port.
//!
//! Token validation is an external concern; the hub only consumes the
//! decision. The shipped implementations cover the two deployments that
//! exist today: trusted single-tenant (allow everything) and a static
//! token table.

use std::collections::HashMap;

use strand_proto::SpaceId;

/// What a request wants to do to a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Observe state: hello, subscribe, get, unsubscribe, acks.
    Read,
    /// Mutate state: transactions.
    Write,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// The request may proceed.
    Ok,
    /// No usable credential was presented (HTTP 401 semantics).
    Unauthorized,
    /// The credential exists but lacks the capability (HTTP 403
    /// semantics).
    Forbidden,
}

/// Decides whether a token may exercise a capability on a space.
pub trait Authorizer: Send + Sync {
    /// Checks one request before dispatch.
    fn authorize(&self, token: &str, space: &SpaceId, capability: Capability) -> AuthDecision;
}

/// Accepts everything. For trusted single-tenant deployments and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _token: &str, _space: &SpaceId, _capability: Capability) -> AuthDecision {
        AuthDecision::Ok
    }
}

/// Static token table: token → per-space capability grants.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    grants: HashMap<String, HashMap<SpaceId, Vec<Capability>>>,
}

impl StaticTokens {
    /// Empty table; every request is unauthorized until grants are added.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `capability` on `space` to `token`.
    #[must_use]
    pub fn grant(mut self, token: &str, space: &SpaceId, capability: Capability) -> Self {
        self.grants
            .entry(token.to_owned())
            .or_default()
            .entry(space.clone())
            .or_default()
            .push(capability);
        self
    }
}

impl Authorizer for StaticTokens {
    fn authorize(&self, token: &str, space: &SpaceId, capability: Capability) -> AuthDecision {
        let Some(spaces) = self.grants.get(token) else {
            return AuthDecision::Unauthorized;
        };
        match spaces.get(space) {
            Some(caps) if caps.contains(&capability) => AuthDecision::Ok,
            // Write grants imply read: a writer can observe what it wrote.
            Some(caps) if capability == Capability::Read && caps.contains(&Capability::Write) => {
                AuthDecision::Ok
            }
            _ => AuthDecision::Forbidden,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_tokens_distinguish_401_from_403() {
        let space = SpaceId::from("did:key:s1");
        let other = SpaceId::from("did:key:s2");
        let auth = StaticTokens::new().grant("tok-rw", &space, Capability::Write);

        assert_eq!(
            auth.authorize("unknown", &space, Capability::Read),
            AuthDecision::Unauthorized
        );
        assert_eq!(
            auth.authorize("tok-rw", &space, Capability::Write),
            AuthDecision::Ok
        );
        assert_eq!(
            auth.authorize("tok-rw", &space, Capability::Read),
            AuthDecision::Ok,
            "write implies read"
        );
        assert_eq!(
            auth.authorize("tok-rw", &other, Capability::Read),
            AuthDecision::Forbidden
        );
    }
}
