//! gRPC service/client glue for the foreman relay.
//!
//! RPC schema source: `proto/fqr_relay.proto`.
//!
//! Control RPCs (generated under [`v1`], service `MaestroService`):
//! - `ScreenComplete`, `NodeQueryComplete`, `NodeFirstError`
//!
//! Results RPC (service `JobResultsService`):
//! - `JobResults` (bidirectional stream: chunks in, one ack per chunk out)
//!
//! [`RelayServices`] serves both on a proxy node and hands every inbound
//! message to a shared [`MaestroForwarder`].

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fqr_common::RelayError;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use crate::forwarding::query_key;
use crate::maestro::MaestroForwarder;
use crate::sender::ResponseSender;

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("fqr.relay.v1");
}

pub use v1::job_results_service_client::JobResultsServiceClient;
pub use v1::job_results_service_server::{JobResultsService, JobResultsServiceServer};
pub use v1::maestro_service_client::MaestroServiceClient;
pub use v1::maestro_service_server::{MaestroService, MaestroServiceServer};

#[derive(Clone)]
/// Inbound side of the relay: both services backed by one [`MaestroForwarder`].
pub struct RelayServices {
    forwarder: Arc<MaestroForwarder>,
}

impl RelayServices {
    pub fn new(forwarder: Arc<MaestroForwarder>) -> Self {
        Self { forwarder }
    }

    pub fn forwarder(&self) -> Arc<MaestroForwarder> {
        Arc::clone(&self.forwarder)
    }

    pub fn maestro_server(&self) -> MaestroServiceServer<Self> {
        MaestroServiceServer::new(self.clone())
    }

    pub fn job_results_server(&self) -> JobResultsServiceServer<Self> {
        JobResultsServiceServer::new(self.clone())
    }
}

#[tonic::async_trait]
impl MaestroService for RelayServices {
    async fn screen_complete(
        &self,
        request: Request<v1::NodeQueryScreenCompletion>,
    ) -> Result<Response<v1::RpcAck>, Status> {
        self.forwarder
            .screen_completed(request.into_inner())
            .await
            .map_err(to_status)?;
        Ok(Response::new(v1::RpcAck { ok: true }))
    }

    async fn node_query_complete(
        &self,
        request: Request<v1::NodeQueryCompletion>,
    ) -> Result<Response<v1::RpcAck>, Status> {
        self.forwarder
            .node_query_completed(request.into_inner())
            .await
            .map_err(to_status)?;
        Ok(Response::new(v1::RpcAck { ok: true }))
    }

    async fn node_first_error(
        &self,
        request: Request<v1::NodeQueryFirstError>,
    ) -> Result<Response<v1::RpcAck>, Status> {
        self.forwarder
            .node_query_mark_first_error(request.into_inner())
            .await
            .map_err(to_status)?;
        Ok(Response::new(v1::RpcAck { ok: true }))
    }
}

type ResponseTx = mpsc::UnboundedSender<Result<v1::JobResultsResponse, Status>>;

#[tonic::async_trait]
impl JobResultsService for RelayServices {
    type JobResultsStream =
        Pin<Box<dyn Stream<Item = Result<v1::JobResultsResponse, Status>> + Send>>;

    async fn job_results(
        &self,
        request: Request<Streaming<v1::JobResultsRequest>>,
    ) -> Result<Response<Self::JobResultsStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_inbound(Arc::clone(&self.forwarder), inbound, tx));
        Ok(Response::new(Box::pin(UnboundedReceiverStream::new(rx))))
    }
}

/// Hand each inbound chunk to the relay; map end-of-stream to completion.
///
/// The response stream stays open until every chunk's sender has resolved.
async fn pump_inbound(
    forwarder: Arc<MaestroForwarder>,
    mut inbound: Streaming<v1::JobResultsRequest>,
    tx: ResponseTx,
) {
    let mut query: Option<String> = None;
    loop {
        match inbound.message().await {
            Ok(Some(request)) => {
                if query.is_none() {
                    query = query_key(request.header.as_ref().and_then(|h| h.query_id.as_ref())).ok();
                }
                let sender = Arc::new(StreamResponseSender::new(request.sequence_id, tx.clone()));
                if let Err(e) = forwarder.data_arrived(request, sender) {
                    warn!(error = %e, "rejecting results stream");
                    if let Some(query) = &query {
                        forwarder.results_error(query, &e);
                    }
                    let _ = tx.send(Err(to_status(e)));
                    return;
                }
            }
            Ok(None) => {
                if let Some(query) = &query {
                    forwarder.results_completed(query);
                }
                debug!(query_id = ?query, "inbound results stream finished");
                return;
            }
            Err(status) => {
                warn!(query_id = ?query, error = %status, "inbound results stream failed");
                if let Some(query) = &query {
                    forwarder.results_error(query, &status);
                }
                return;
            }
        }
    }
}

/// Writes one chunk's outcome onto the executor's response stream.
struct StreamResponseSender {
    sequence_id: i64,
    responded: AtomicBool,
    tx: ResponseTx,
}

impl StreamResponseSender {
    fn new(sequence_id: i64, tx: ResponseTx) -> Self {
        Self {
            sequence_id,
            responded: AtomicBool::new(false),
            tx,
        }
    }

    fn respond(&self, item: Result<v1::JobResultsResponse, Status>) -> fqr_common::Result<()> {
        if self.responded.swap(true, Ordering::AcqRel) {
            return Err(RelayError::InvalidState(format!(
                "chunk {} already answered",
                self.sequence_id
            )));
        }
        // Executor hung up; nobody left to tell.
        let _ = self.tx.send(item);
        Ok(())
    }
}

impl ResponseSender for StreamResponseSender {
    fn send_ack(&self) -> fqr_common::Result<()> {
        self.respond(Ok(v1::JobResultsResponse {
            sequence_id: self.sequence_id,
        }))
    }

    fn send_failure(&self, err: RelayError) -> fqr_common::Result<()> {
        self.respond(Err(to_status(err)))
    }
}

fn to_status(err: RelayError) -> Status {
    match err {
        RelayError::QueryTerminated(_) => Status::failed_precondition(err.to_string()),
        RelayError::Forwarding { .. } | RelayError::Transport(_) => {
            Status::unavailable(err.to_string())
        }
        RelayError::InvalidRequest(msg) | RelayError::InvalidConfig(msg) => {
            Status::invalid_argument(msg)
        }
        RelayError::InvalidState(msg) => Status::internal(msg),
        RelayError::Io(e) => Status::internal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_errors_map_to_grpc_codes() {
        assert_eq!(
            to_status(RelayError::QueryTerminated("q".to_string())).code(),
            tonic::Code::FailedPrecondition
        );
        assert_eq!(
            to_status(RelayError::Forwarding {
                foreman: "owner:2".to_string(),
                message: "reset".to_string(),
            })
            .code(),
            tonic::Code::Unavailable
        );
        assert_eq!(
            to_status(RelayError::Transport("refused".to_string())).code(),
            tonic::Code::Unavailable
        );
        assert_eq!(
            to_status(RelayError::InvalidRequest("no id".to_string())).code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            to_status(RelayError::InvalidState("twice".to_string())).code(),
            tonic::Code::Internal
        );
    }

    #[tokio::test]
    async fn stream_sender_answers_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = StreamResponseSender::new(7, tx);
        sender.send_ack().expect("first answer");
        assert!(matches!(
            sender.send_failure(RelayError::Transport("late".to_string())),
            Err(RelayError::InvalidState(_))
        ));
        let item = rx.recv().await.expect("ack").expect("ok item");
        assert_eq!(item.sequence_id, 7);
        drop(sender);
        assert!(rx.recv().await.is_none());
    }
}
