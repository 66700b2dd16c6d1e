//! Transport seam between the relay and remote foremen.
//!
//! The relay never builds connections itself. It asks a [`ChannelProvider`]
//! for a [`ForemanChannel`] to the owning node and issues calls on it.
//! [`GrpcChannelProvider`] is the production implementation; tests plug in
//! an in-process provider.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fqr_common::{RelayConfig, RelayError, Result};
use futures::stream::{BoxStream, StreamExt};
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::grpc::{JobResultsServiceClient, MaestroServiceClient, v1};

/// Outbound half of a results session: chunks in write order.
pub type ResultsOutbound = BoxStream<'static, v1::JobResultsRequest>;

/// Inbound half of a results session: one item per acknowledged chunk,
/// or the error that ended the session.
pub type AckStream = BoxStream<'static, std::result::Result<v1::JobResultsResponse, tonic::Status>>;

#[tonic::async_trait]
/// Calls the relay issues against one foreman.
pub trait ForemanChannel: Send + Sync {
    /// Notify the foreman that a screen fragment finished.
    async fn screen_complete(&self, completion: v1::NodeQueryScreenCompletion) -> Result<()>;
    /// Notify the foreman that a node finished its part of a query.
    async fn node_query_complete(&self, completion: v1::NodeQueryCompletion) -> Result<()>;
    /// Notify the foreman of the first fragment error seen on a node.
    async fn node_first_error(&self, error: v1::NodeQueryFirstError) -> Result<()>;
    /// Open a results session that drains `outbound` and yields acknowledgments.
    async fn job_results(
        &self,
        outbound: ResultsOutbound,
    ) -> std::result::Result<AckStream, tonic::Status>;
}

/// Source of reusable channels keyed by node identity.
///
/// Caching and reuse are the provider's concern.
pub trait ChannelProvider: Send + Sync {
    fn get_or_create_channel(&self, endpoint: &v1::NodeEndpoint) -> Result<Arc<dyn ForemanChannel>>;
}

#[derive(Debug, Clone)]
/// tonic-backed foreman channel.
pub struct GrpcForemanChannel {
    channel: Channel,
}

impl GrpcForemanChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[tonic::async_trait]
impl ForemanChannel for GrpcForemanChannel {
    async fn screen_complete(&self, completion: v1::NodeQueryScreenCompletion) -> Result<()> {
        let mut client = MaestroServiceClient::new(self.channel.clone());
        client
            .screen_complete(completion)
            .await
            .map_err(map_tonic_err)?;
        Ok(())
    }

    async fn node_query_complete(&self, completion: v1::NodeQueryCompletion) -> Result<()> {
        let mut client = MaestroServiceClient::new(self.channel.clone());
        client
            .node_query_complete(completion)
            .await
            .map_err(map_tonic_err)?;
        Ok(())
    }

    async fn node_first_error(&self, error: v1::NodeQueryFirstError) -> Result<()> {
        let mut client = MaestroServiceClient::new(self.channel.clone());
        client
            .node_first_error(error)
            .await
            .map_err(map_tonic_err)?;
        Ok(())
    }

    async fn job_results(
        &self,
        outbound: ResultsOutbound,
    ) -> std::result::Result<AckStream, tonic::Status> {
        let mut client = JobResultsServiceClient::new(self.channel.clone());
        let response = client.job_results(OutboundStream(outbound)).await?;
        Ok(response.into_inner().boxed())
    }
}

/// Concrete wrapper around [`ResultsOutbound`]. Handing the boxed `dyn Stream`
/// to the tonic client directly trips a higher-ranked lifetime error when the
/// call's future must be proven `Send`.
struct OutboundStream(ResultsOutbound);

impl futures::Stream for OutboundStream {
    type Item = v1::JobResultsRequest;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx)
    }
}

#[derive(Debug)]
/// Provider that keeps one lazily connected tonic channel per foreman address.
pub struct GrpcChannelProvider {
    config: RelayConfig,
    channels: DashMap<String, Channel>,
}

impl GrpcChannelProvider {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
        }
    }

    /// Number of distinct foreman addresses with a cached channel.
    pub fn cached_channels(&self) -> usize {
        self.channels.len()
    }

    fn build_channel(&self, uri: &str) -> Result<Channel> {
        let mut endpoint = Endpoint::from_shared(uri.to_string())
            .map_err(|e| RelayError::InvalidConfig(format!("invalid foreman uri {uri}: {e}")))?
            .connect_timeout(Duration::from_millis(self.config.connect_timeout_ms))
            .keep_alive_timeout(Duration::from_millis(self.config.keepalive_timeout_ms));
        if self.config.tcp_keepalive_ms > 0 {
            endpoint =
                endpoint.tcp_keepalive(Some(Duration::from_millis(self.config.tcp_keepalive_ms)));
        }
        if self.config.http2_keepalive_interval_ms > 0 {
            endpoint = endpoint
                .http2_keep_alive_interval(Duration::from_millis(
                    self.config.http2_keepalive_interval_ms,
                ))
                .keep_alive_while_idle(true);
        }
        if self.config.concurrency_limit_per_channel > 0 {
            endpoint = endpoint.concurrency_limit(self.config.concurrency_limit_per_channel);
        }
        Ok(endpoint.connect_lazy())
    }
}

impl Default for GrpcChannelProvider {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

impl ChannelProvider for GrpcChannelProvider {
    fn get_or_create_channel(&self, endpoint: &v1::NodeEndpoint) -> Result<Arc<dyn ForemanChannel>> {
        let uri = endpoint_uri(endpoint)?;
        let channel = match self.channels.get(&uri) {
            Some(cached) => cached.clone(),
            None => {
                let channel = self
                    .channels
                    .entry(uri.clone())
                    .or_try_insert_with(|| self.build_channel(&uri))?
                    .clone();
                debug!(foreman = %uri, "created foreman channel");
                channel
            }
        };
        Ok(Arc::new(GrpcForemanChannel::new(channel)))
    }
}

/// `http://address:fabric_port`, keeping an explicit scheme if the address has one.
pub fn endpoint_uri(endpoint: &v1::NodeEndpoint) -> Result<String> {
    if endpoint.address.is_empty() {
        return Err(RelayError::InvalidRequest(
            "foreman endpoint has no address".to_string(),
        ));
    }
    if endpoint.address.starts_with("http://") || endpoint.address.starts_with("https://") {
        Ok(format!("{}:{}", endpoint.address, endpoint.fabric_port))
    } else {
        Ok(format!("http://{}:{}", endpoint.address, endpoint.fabric_port))
    }
}

pub(crate) fn map_tonic_err(err: tonic::Status) -> RelayError {
    RelayError::Transport(format!("grpc call failed: {err}"))
}
