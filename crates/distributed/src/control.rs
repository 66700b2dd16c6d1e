//! Forward-or-drop handling for one-shot query lifecycle notifications.
//!
//! Each notification names the foreman that owns the query. If that is some
//! other node the message goes out as a single unary call; otherwise it is a
//! stale signal for a query this node has already finished with, and it is
//! dropped with a warning. Call failures are returned to the caller and never
//! retried here. No local state is kept.

use std::sync::Arc;

use fqr_common::Result;
use fqr_common::metrics::global_metrics;
use tracing::{debug, warn};

use crate::channel::{ChannelProvider, ForemanChannel};
use crate::forwarding::{EndpointDisplay, EndpointProvider, must_forward, query_label};
use crate::grpc::v1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The three notification kinds carried by the maestro service.
pub enum SignalKind {
    ScreenCompleted,
    NodeQueryCompleted,
    NodeQueryFirstError,
}

impl SignalKind {
    /// Metric/log label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScreenCompleted => "screen_completed",
            Self::NodeQueryCompleted => "node_query_completed",
            Self::NodeQueryFirstError => "node_query_first_error",
        }
    }
}

/// Forwards lifecycle notifications to the owning foreman.
pub struct ControlSignalForwarder {
    channels: Arc<dyn ChannelProvider>,
    self_endpoint: Arc<dyn EndpointProvider>,
}

impl ControlSignalForwarder {
    pub fn new(
        channels: Arc<dyn ChannelProvider>,
        self_endpoint: Arc<dyn EndpointProvider>,
    ) -> Self {
        Self {
            channels,
            self_endpoint,
        }
    }

    pub async fn screen_completed(&self, completion: v1::NodeQueryScreenCompletion) -> Result<()> {
        let Some(channel) = self.route(
            SignalKind::ScreenCompleted,
            completion.foreman.as_ref(),
            completion.id.as_ref(),
            completion.endpoint.as_ref(),
        )?
        else {
            return Ok(());
        };
        channel.screen_complete(completion).await?;
        global_metrics().inc_control_signal_forwarded(SignalKind::ScreenCompleted.as_str());
        Ok(())
    }

    pub async fn node_query_completed(&self, completion: v1::NodeQueryCompletion) -> Result<()> {
        let Some(channel) = self.route(
            SignalKind::NodeQueryCompleted,
            completion.foreman.as_ref(),
            completion.id.as_ref(),
            completion.endpoint.as_ref(),
        )?
        else {
            return Ok(());
        };
        channel.node_query_complete(completion).await?;
        global_metrics().inc_control_signal_forwarded(SignalKind::NodeQueryCompleted.as_str());
        Ok(())
    }

    pub async fn node_query_mark_first_error(&self, error: v1::NodeQueryFirstError) -> Result<()> {
        let query_id = error.handle.as_ref().and_then(|h| h.query_id.as_ref());
        let Some(channel) = self.route(
            SignalKind::NodeQueryFirstError,
            error.foreman.as_ref(),
            query_id,
            error.endpoint.as_ref(),
        )?
        else {
            return Ok(());
        };
        channel.node_first_error(error).await?;
        global_metrics().inc_control_signal_forwarded(SignalKind::NodeQueryFirstError.as_str());
        Ok(())
    }

    /// Channel to the foreman if the signal must be forwarded, `None` if dropped.
    fn route(
        &self,
        kind: SignalKind,
        foreman: Option<&v1::NodeEndpoint>,
        query_id: Option<&v1::QueryId>,
        from: Option<&v1::NodeEndpoint>,
    ) -> Result<Option<Arc<dyn ForemanChannel>>> {
        let query = query_label(query_id);
        let Some(target) = foreman.filter(|_| must_forward(foreman, self.self_endpoint.as_ref()))
        else {
            warn!(
                kind = kind.as_str(),
                query_id = %query,
                from = %EndpointDisplay(from),
                "control signal arrived post query termination, dropping"
            );
            global_metrics().inc_control_signal_dropped(kind.as_str());
            return Ok(None);
        };
        debug!(
            kind = kind.as_str(),
            query_id = %query,
            from = %EndpointDisplay(from),
            foreman = %EndpointDisplay(Some(target)),
            "forwarding control signal"
        );
        Ok(Some(self.channels.get_or_create_channel(target)?))
    }
}
