//! Relay facade used by the RPC layer.
//!
//! [`MaestroForwarder`] bundles the control-signal forwarder and the results
//! relay behind one handle that shares a channel provider and node identity.

use std::fmt;
use std::sync::Arc;

use fqr_common::{RelayConfig, Result};
use tokio::runtime::Handle;

use crate::channel::{ChannelProvider, GrpcChannelProvider};
use crate::control::ControlSignalForwarder;
use crate::forwarding::EndpointProvider;
use crate::grpc::v1;
use crate::results::ResultsRelay;
use crate::sender::ResponseSender;

/// Forwards control signals and result chunks to the foreman owning each query.
pub struct MaestroForwarder {
    control: ControlSignalForwarder,
    results: ResultsRelay,
}

impl MaestroForwarder {
    /// Results sessions are spawned on `runtime`.
    pub fn new(
        channels: Arc<dyn ChannelProvider>,
        self_endpoint: Arc<dyn EndpointProvider>,
        runtime: Handle,
    ) -> Self {
        Self {
            control: ControlSignalForwarder::new(Arc::clone(&channels), Arc::clone(&self_endpoint)),
            results: ResultsRelay::new(channels, self_endpoint, runtime),
        }
    }

    /// Forwarder that reaches foremen over gRPC channels built from `config`.
    pub fn grpc(config: RelayConfig, self_endpoint: v1::NodeEndpoint, runtime: Handle) -> Self {
        Self::new(
            Arc::new(GrpcChannelProvider::new(config)),
            Arc::new(self_endpoint),
            runtime,
        )
    }

    pub async fn screen_completed(&self, completion: v1::NodeQueryScreenCompletion) -> Result<()> {
        self.control.screen_completed(completion).await
    }

    pub async fn node_query_completed(&self, completion: v1::NodeQueryCompletion) -> Result<()> {
        self.control.node_query_completed(completion).await
    }

    pub async fn node_query_mark_first_error(&self, error: v1::NodeQueryFirstError) -> Result<()> {
        self.control.node_query_mark_first_error(error).await
    }

    /// See [`ResultsRelay::data_arrived`].
    pub fn data_arrived(
        &self,
        request: v1::JobResultsRequest,
        sender: Arc<dyn ResponseSender>,
    ) -> Result<()> {
        self.results.data_arrived(request, sender)
    }

    pub fn results_completed(&self, query_id: &str) {
        self.results.results_completed(query_id)
    }

    pub fn results_error(&self, query_id: &str, cause: impl fmt::Display) {
        self.results.results_error(query_id, cause)
    }

    /// Results relay, for stream introspection.
    pub fn results(&self) -> &ResultsRelay {
        &self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeForeman, Outcome, RecordingSender, UnaryCall, chunk, endpoint, query_id, wait_until};
    use parking_lot::Mutex;

    #[tokio::test]
    async fn facade_routes_signals_and_chunks_through_one_provider() {
        let foreman = FakeForeman::new();
        let forwarder = MaestroForwarder::new(
            Arc::new(foreman.clone()),
            Arc::new(endpoint("proxy", 1)),
            Handle::current(),
        );
        let owner = endpoint("owner", 2);
        let journal = Arc::new(Mutex::new(Vec::new()));

        forwarder
            .data_arrived(chunk(1, 0, Some(owner.clone())), RecordingSender::new(0, &journal))
            .expect("chunk");
        let session = foreman.session(0).await;
        session.next_request().await.expect("chunk");
        session.ack();
        wait_until(|| journal.lock().len() == 1).await;

        let completion = v1::NodeQueryCompletion {
            id: Some(query_id(1)),
            endpoint: Some(endpoint("exec", 3)),
            foreman: Some(owner.clone()),
        };
        forwarder
            .node_query_completed(completion.clone())
            .await
            .expect("completion");

        assert_eq!(journal.lock().clone(), vec![Outcome::Ack(0)]);
        assert_eq!(foreman.unary_calls(), vec![UnaryCall::NodeQueryComplete(completion)]);
        assert_eq!(forwarder.results().active_streams(), 1);
    }
}
