//! Multiplexed forwarding of query result chunks to the owning foreman.
//!
//! One outbound results session exists per query. Every producer thread that
//! calls [`ResultsRelay::data_arrived`] for that query writes onto the same
//! session, and the relay keeps a FIFO of the callers' response senders next
//! to it. The foreman acknowledges chunks in receipt order, so each
//! acknowledgment pops the oldest sender.
//!
//! Invariants:
//! - at most one registered stream per query id; creation happens under the
//!   registry entry lock, losers of a creation race reuse the winner's stream;
//! - appending a sender and writing its chunk happen under the stream's own
//!   lock, so queue order equals wire order;
//! - acknowledgments are handled by the session task without any producer
//!   lock held across the callback;
//! - every sender gets exactly one outcome: an ack, or a failure when the
//!   stream errors, is torn down with an error, or closes early.
//!
//! Outbound writes are unbounded; there is no backpressure against the
//! number of unacknowledged chunks.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fqr_common::metrics::global_metrics;
use fqr_common::{RelayError, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelProvider, ForemanChannel, ResultsOutbound};
use crate::forwarding::{EndpointProvider, endpoint_address, must_forward, query_key};
use crate::grpc::v1;
use crate::sender::{ResponseSender, ack_quietly, fail_quietly};

type StreamRegistry = Arc<DashMap<String, Arc<ResultsStream>>>;

/// Outbound results session for one query plus its pending-ack queue.
struct ResultsStream {
    query_id: String,
    foreman: String,
    state: Mutex<StreamState>,
    session: Mutex<Option<AbortHandle>>,
}

struct StreamState {
    /// `None` once the stream has been closed locally or failed.
    outbound: Option<mpsc::UnboundedSender<v1::JobResultsRequest>>,
    pending: VecDeque<Arc<dyn ResponseSender>>,
}

impl ResultsStream {
    fn new(
        query_id: String,
        foreman: String,
        outbound: mpsc::UnboundedSender<v1::JobResultsRequest>,
    ) -> Self {
        Self {
            query_id,
            foreman,
            state: Mutex::new(StreamState {
                outbound: Some(outbound),
                pending: VecDeque::new(),
            }),
            session: Mutex::new(None),
        }
    }

    /// Enqueue `sender` and write `request` as one unit.
    ///
    /// Hands the sender back if the stream no longer accepts writes.
    fn write(
        &self,
        request: v1::JobResultsRequest,
        sender: Arc<dyn ResponseSender>,
    ) -> std::result::Result<(), Arc<dyn ResponseSender>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(outbound) = state.outbound.as_ref() else {
            return Err(sender);
        };
        state.pending.push_back(sender);
        if outbound.send(request).is_err() {
            // Session task is gone; its error path will not see this sender.
            state.outbound = None;
            return state.pending.pop_back().map_or(Ok(()), Err);
        }
        Ok(())
    }

    /// Resolve the oldest pending sender.
    fn acknowledge(&self) {
        let next = self.state.lock().pending.pop_front();
        match next {
            Some(sender) => ack_quietly(sender.as_ref()),
            None => {
                warn!(
                    query_id = %self.query_id,
                    foreman = %self.foreman,
                    "acknowledgment received with no pending sender, ignoring"
                );
                global_metrics().inc_ack_anomaly();
            }
        }
    }

    /// Stop accepting writes and take every unacknowledged sender.
    fn seal(&self) -> Vec<Arc<dyn ResponseSender>> {
        let mut state = self.state.lock();
        state.outbound = None;
        state.pending.drain(..).collect()
    }

    /// Graceful end-of-stream; outstanding acks still resolve their senders.
    fn close(&self) {
        self.state.lock().outbound = None;
    }

    fn fail_senders(&self, senders: Vec<Arc<dyn ResponseSender>>, message: &str) {
        for sender in senders {
            fail_quietly(
                sender.as_ref(),
                RelayError::Forwarding {
                    foreman: self.foreman.clone(),
                    message: message.to_string(),
                },
            );
        }
    }

    fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn set_session(&self, handle: AbortHandle) {
        *self.session.lock() = Some(handle);
    }

    fn abort_session(&self) {
        if let Some(handle) = self.session.lock().take() {
            handle.abort();
        }
    }
}

/// Per-query results forwarding with ack correlation.
pub struct ResultsRelay {
    channels: Arc<dyn ChannelProvider>,
    self_endpoint: Arc<dyn EndpointProvider>,
    streams: StreamRegistry,
    runtime: Handle,
}

impl ResultsRelay {
    /// Session tasks run on `runtime`, whichever thread delivers the chunk.
    pub fn new(
        channels: Arc<dyn ChannelProvider>,
        self_endpoint: Arc<dyn EndpointProvider>,
        runtime: Handle,
    ) -> Self {
        Self {
            channels,
            self_endpoint,
            streams: Arc::new(DashMap::new()),
            runtime,
        }
    }

    /// Forward one result chunk, or fail `sender` if this node must not forward it.
    ///
    /// Never waits for the remote acknowledgment. Safe to call from plain
    /// threads as well as from runtime tasks.
    ///
    /// Returns an error only when the chunk carries no query id.
    pub fn data_arrived(
        &self,
        request: v1::JobResultsRequest,
        sender: Arc<dyn ResponseSender>,
    ) -> Result<()> {
        let query_id = query_key(request.header.as_ref().and_then(|h| h.query_id.as_ref()))?;
        let foreman = match request.foreman.as_ref() {
            Some(foreman) if must_forward(Some(foreman), self.self_endpoint.as_ref()) => {
                foreman.clone()
            }
            _ => {
                warn!(
                    query_id = %query_id,
                    foreman = %endpoint_address(request.foreman.as_ref()),
                    "user data arrived post query termination, dropping"
                );
                global_metrics().inc_result_chunk_rejected();
                fail_quietly(sender.as_ref(), RelayError::QueryTerminated(query_id));
                return Ok(());
            }
        };
        debug!(
            query_id = %query_id,
            sequence_id = request.sequence_id,
            foreman = %endpoint_address(Some(&foreman)),
            "forwarding result chunk"
        );

        let stream = match self.stream_for(&query_id, &foreman) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(query_id = %query_id, error = %e, "could not open results stream");
                global_metrics().inc_result_chunk_rejected();
                fail_quietly(
                    sender.as_ref(),
                    RelayError::Forwarding {
                        foreman: endpoint_address(Some(&foreman)),
                        message: e.to_string(),
                    },
                );
                return Ok(());
            }
        };
        match stream.write(request, sender) {
            Ok(()) => global_metrics().inc_result_chunk_forwarded(),
            Err(sender) => {
                warn!(query_id = %query_id, "results stream closed while writing, dropping chunk");
                global_metrics().inc_result_chunk_rejected();
                fail_quietly(sender.as_ref(), RelayError::QueryTerminated(query_id));
            }
        }
        Ok(())
    }

    /// Gracefully end the query's stream and drop it from the registry.
    ///
    /// No-op when the query has no stream.
    pub fn results_completed(&self, query_id: &str) {
        let Some((_, stream)) = self.streams.remove(query_id) else {
            return;
        };
        stream.close();
        global_metrics().record_result_stream_closed("completed");
        debug!(query_id = %query_id, "closed results stream");
    }

    /// Tear down the query's stream with `cause`.
    ///
    /// Unacknowledged senders are failed with the cause and the outbound call
    /// is cancelled. No-op when the query has no stream.
    pub fn results_error(&self, query_id: &str, cause: impl fmt::Display) {
        let Some((_, stream)) = self.streams.remove(query_id) else {
            return;
        };
        let cause = cause.to_string();
        let pending = stream.seal();
        stream.abort_session();
        global_metrics().record_result_stream_closed("local_error");
        warn!(
            query_id = %query_id,
            foreman = %stream.foreman,
            pending = pending.len(),
            cause = %cause,
            "aborting results stream"
        );
        stream.fail_senders(pending, &cause);
    }

    /// Number of queries with a registered stream.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Unacknowledged chunks for `query_id`, if it has a stream.
    pub fn pending_acks(&self, query_id: &str) -> Option<usize> {
        self.streams.get(query_id).map(|s| s.pending_len())
    }

    fn stream_for(&self, query_id: &str, foreman: &v1::NodeEndpoint) -> Result<Arc<ResultsStream>> {
        if let Some(existing) = self.streams.get(query_id) {
            return Ok(Arc::clone(existing.value()));
        }
        // Channel providers may build connections; keep that out of the shard lock.
        // A caller that loses the creation race just leaves a cached channel behind.
        let channel = {
            let _runtime = self.runtime.enter();
            self.channels.get_or_create_channel(foreman)?
        };
        match self.streams.entry(query_id.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let stream = self.open_stream(query_id, foreman, channel);
                entry.insert(Arc::clone(&stream));
                Ok(stream)
            }
        }
    }

    /// Build a stream with its session task already listening for acks.
    ///
    /// Runs under the registry entry lock; only allocates and spawns.
    fn open_stream(
        &self,
        query_id: &str,
        foreman: &v1::NodeEndpoint,
        channel: Arc<dyn ForemanChannel>,
    ) -> Arc<ResultsStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = Arc::new(ResultsStream::new(
            query_id.to_string(),
            endpoint_address(Some(foreman)),
            tx,
        ));
        // Detached from the caller: the session outlives whichever request opened it.
        let session = self.runtime.spawn(run_session(
            Arc::clone(&stream),
            channel,
            UnboundedReceiverStream::new(rx).boxed(),
            Arc::clone(&self.streams),
        ));
        stream.set_session(session.abort_handle());
        global_metrics().record_result_stream_opened();
        info!(query_id = %query_id, foreman = %stream.foreman, "opened results stream");
        stream
    }
}

impl Drop for ResultsRelay {
    fn drop(&mut self) {
        self.streams.retain(|_, stream| {
            stream.close();
            global_metrics().record_result_stream_closed("shutdown");
            false
        });
    }
}

/// Drive one results session: open the call, then consume acknowledgments.
async fn run_session(
    stream: Arc<ResultsStream>,
    channel: Arc<dyn ForemanChannel>,
    outbound: ResultsOutbound,
    registry: StreamRegistry,
) {
    let mut acks = match channel.job_results(outbound).await {
        Ok(acks) => acks,
        Err(status) => {
            on_remote_error(&stream, &registry, status);
            return;
        }
    };
    while let Some(item) = acks.next().await {
        match item {
            Ok(_) => stream.acknowledge(),
            Err(status) => {
                on_remote_error(&stream, &registry, status);
                return;
            }
        }
    }
    on_remote_closed(&stream, &registry);
}

/// Remove `stream` from the registry unless a newer stream replaced it.
fn unregister(stream: &Arc<ResultsStream>, registry: &StreamRegistry) -> bool {
    registry
        .remove_if(&stream.query_id, |_, registered| Arc::ptr_eq(registered, stream))
        .is_some()
}

fn on_remote_error(stream: &Arc<ResultsStream>, registry: &StreamRegistry, status: tonic::Status) {
    error!(
        query_id = %stream.query_id,
        foreman = %stream.foreman,
        code = ?status.code(),
        error = %status.message(),
        "failed to forward job results"
    );
    if unregister(stream, registry) {
        global_metrics().record_result_stream_closed("remote_error");
    }
    let pending = stream.seal();
    stream.fail_senders(pending, &status.to_string());
}

fn on_remote_closed(stream: &Arc<ResultsStream>, registry: &StreamRegistry) {
    let initiated_remotely = unregister(stream, registry);
    if initiated_remotely {
        global_metrics().record_result_stream_closed("remote_closed");
    }
    let pending = stream.seal();
    if initiated_remotely || !pending.is_empty() {
        warn!(
            query_id = %stream.query_id,
            foreman = %stream.foreman,
            pending = pending.len(),
            "foreman closed results stream before acknowledging all chunks"
        );
        stream.fail_senders(pending, "foreman closed results stream before acknowledgment");
    } else {
        info!(query_id = %stream.query_id, "forwarding for query complete");
    }
}

#[cfg(test)]
#[path = "results_tests.rs"]
mod tests;
