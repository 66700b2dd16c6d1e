//! Local-vs-remote routing decision.
//!
//! The decision looks only at endpoint identity and never consults liveness
//! or coordinator membership. An unreachable foreman shows up later as a
//! transport failure on the send itself.

use std::fmt;

use fqr_common::{QueryId, RelayError, Result};

use crate::grpc::v1;

/// Synchronous accessor for a node identity.
pub trait EndpointProvider: Send + Sync {
    fn endpoint(&self) -> v1::NodeEndpoint;
}

impl EndpointProvider for v1::NodeEndpoint {
    fn endpoint(&self) -> v1::NodeEndpoint {
        self.clone()
    }
}

/// Returns true when a message addressed to `target` must leave this process.
///
/// An absent target is treated as local. Only test harnesses send those.
pub fn must_forward(target: Option<&v1::NodeEndpoint>, self_endpoint: &dyn EndpointProvider) -> bool {
    match target {
        None => false,
        Some(target) => *target != self_endpoint.endpoint(),
    }
}

/// Registry key for a wire query id.
pub fn query_key(id: Option<&v1::QueryId>) -> Result<String> {
    id.map(|id| QueryId::new(id.part1, id.part2).to_string())
        .ok_or_else(|| RelayError::InvalidRequest("message carries no query id".to_string()))
}

/// Query id for log fields; never fails.
pub(crate) fn query_label(id: Option<&v1::QueryId>) -> String {
    query_key(id).unwrap_or_else(|_| "<unknown>".to_string())
}

/// Display adapter for an optional endpoint in log fields.
pub(crate) struct EndpointDisplay<'a>(pub Option<&'a v1::NodeEndpoint>);

impl fmt::Display for EndpointDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ep) => write!(f, "{}:{}", ep.address, ep.fabric_port),
            None => f.write_str("<unknown>"),
        }
    }
}

pub(crate) fn endpoint_address(ep: Option<&v1::NodeEndpoint>) -> String {
    EndpointDisplay(ep).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(address: &str, port: u32) -> v1::NodeEndpoint {
        v1::NodeEndpoint {
            address: address.to_string(),
            fabric_port: port,
            user_port: 0,
            instance_id: String::new(),
        }
    }

    #[test]
    fn absent_target_is_handled_locally() {
        let me = endpoint("coord-a", 45678);
        assert!(!must_forward(None, &me));
    }

    #[test]
    fn self_target_is_handled_locally() {
        let me = endpoint("coord-a", 45678);
        assert!(!must_forward(Some(&endpoint("coord-a", 45678)), &me));
    }

    #[test]
    fn any_field_difference_forces_forwarding() {
        let me = endpoint("coord-a", 45678);
        assert!(must_forward(Some(&endpoint("coord-b", 45678)), &me));
        assert!(must_forward(Some(&endpoint("coord-a", 45679)), &me));
        let mut other_instance = endpoint("coord-a", 45678);
        other_instance.instance_id = "restarted".to_string();
        assert!(must_forward(Some(&other_instance), &me));
    }

    #[test]
    fn query_key_requires_an_id() {
        assert!(matches!(query_key(None), Err(RelayError::InvalidRequest(_))));
        let key = query_key(Some(&v1::QueryId { part1: 1, part2: 2 })).expect("key");
        assert_eq!(key, "00000000-0000-0001-0000-000000000002");
    }

    #[test]
    fn endpoint_display_handles_missing_endpoint() {
        assert_eq!(endpoint_address(None), "<unknown>");
        assert_eq!(endpoint_address(Some(&endpoint("10.1.1.1", 9000))), "10.1.1.1:9000");
    }
}
