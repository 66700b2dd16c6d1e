//! In-process foreman used by relay unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fqr_common::{RelayError, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::channel::{AckStream, ChannelProvider, ForemanChannel, ResultsOutbound};
use crate::grpc::v1;
use crate::sender::ResponseSender;

const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn endpoint(address: &str, port: u32) -> v1::NodeEndpoint {
    v1::NodeEndpoint {
        address: address.to_string(),
        fabric_port: port,
        user_port: 0,
        instance_id: String::new(),
    }
}

pub(crate) fn query_id(n: u64) -> v1::QueryId {
    v1::QueryId { part1: 0, part2: n }
}

pub(crate) fn chunk(query: u64, sequence_id: i64, foreman: Option<v1::NodeEndpoint>) -> v1::JobResultsRequest {
    v1::JobResultsRequest {
        header: Some(v1::QueryDataHeader {
            query_id: Some(query_id(query)),
            row_count: 1,
        }),
        sequence_id,
        data: vec![sequence_id as u8],
        foreman,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum UnaryCall {
    ScreenComplete(v1::NodeQueryScreenCompletion),
    NodeQueryComplete(v1::NodeQueryCompletion),
    NodeFirstError(v1::NodeQueryFirstError),
}

/// One results session opened against the fake.
pub(crate) struct FakeSession {
    outbound: tokio::sync::Mutex<ResultsOutbound>,
    acks: Mutex<Option<mpsc::UnboundedSender<std::result::Result<v1::JobResultsResponse, tonic::Status>>>>,
}

impl FakeSession {
    /// Next chunk in wire order, `None` once the relay closed its side.
    pub(crate) async fn next_request(&self) -> Option<v1::JobResultsRequest> {
        let mut outbound = self.outbound.lock().await;
        tokio::time::timeout(WAIT, outbound.next())
            .await
            .expect("timed out waiting for a forwarded chunk")
    }

    pub(crate) fn ack(&self) {
        if let Some(tx) = self.acks.lock().as_ref() {
            let _ = tx.send(Ok(v1::JobResultsResponse::default()));
        }
    }

    pub(crate) fn fail(&self, status: tonic::Status) {
        if let Some(tx) = self.acks.lock().take() {
            let _ = tx.send(Err(status));
        }
    }

    /// End the ack stream cleanly from the foreman side.
    pub(crate) fn finish(&self) {
        self.acks.lock().take();
    }
}

#[derive(Default)]
struct FakeForemanInner {
    lookups: Mutex<Vec<v1::NodeEndpoint>>,
    calls: Mutex<Vec<UnaryCall>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    unary_failure: Mutex<Option<String>>,
    open_failure: Mutex<Option<tonic::Status>>,
}

#[derive(Clone, Default)]
/// Channel provider and foreman channel in one; records everything it sees.
pub(crate) struct FakeForeman {
    inner: Arc<FakeForemanInner>,
}

impl FakeForeman {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lookups(&self) -> Vec<v1::NodeEndpoint> {
        self.inner.lookups.lock().clone()
    }

    pub(crate) fn unary_calls(&self) -> Vec<UnaryCall> {
        self.inner.calls.lock().clone()
    }

    pub(crate) fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub(crate) fn fail_unary_calls(&self, message: &str) {
        *self.inner.unary_failure.lock() = Some(message.to_string());
    }

    pub(crate) fn fail_next_open(&self, status: tonic::Status) {
        *self.inner.open_failure.lock() = Some(status);
    }

    /// Wait until the `idx`-th session has been opened.
    pub(crate) async fn session(&self, idx: usize) -> Arc<FakeSession> {
        let inner = Arc::clone(&self.inner);
        wait_for(move || inner.sessions.lock().get(idx).cloned()).await
    }

    fn record(&self, call: UnaryCall) -> Result<()> {
        self.inner.calls.lock().push(call);
        match self.inner.unary_failure.lock().as_ref() {
            Some(message) => Err(RelayError::Transport(format!("grpc call failed: {message}"))),
            None => Ok(()),
        }
    }
}

impl ChannelProvider for FakeForeman {
    fn get_or_create_channel(&self, endpoint: &v1::NodeEndpoint) -> Result<Arc<dyn ForemanChannel>> {
        self.inner.lookups.lock().push(endpoint.clone());
        Ok(Arc::new(self.clone()))
    }
}

#[tonic::async_trait]
impl ForemanChannel for FakeForeman {
    async fn screen_complete(&self, completion: v1::NodeQueryScreenCompletion) -> Result<()> {
        self.record(UnaryCall::ScreenComplete(completion))
    }

    async fn node_query_complete(&self, completion: v1::NodeQueryCompletion) -> Result<()> {
        self.record(UnaryCall::NodeQueryComplete(completion))
    }

    async fn node_first_error(&self, error: v1::NodeQueryFirstError) -> Result<()> {
        self.record(UnaryCall::NodeFirstError(error))
    }

    async fn job_results(
        &self,
        outbound: ResultsOutbound,
    ) -> std::result::Result<AckStream, tonic::Status> {
        if let Some(status) = self.inner.open_failure.lock().take() {
            return Err(status);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.sessions.lock().push(Arc::new(FakeSession {
            outbound: tokio::sync::Mutex::new(outbound),
            acks: Mutex::new(Some(tx)),
        }));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Ack(i64),
    Failure(i64, String),
}

/// Sender that logs its outcome into a shared journal and counts calls.
pub(crate) struct RecordingSender {
    tag: i64,
    journal: Arc<Mutex<Vec<Outcome>>>,
    calls: AtomicUsize,
}

impl RecordingSender {
    pub(crate) fn new(tag: i64, journal: &Arc<Mutex<Vec<Outcome>>>) -> Arc<Self> {
        Arc::new(Self {
            tag,
            journal: Arc::clone(journal),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn claim(&self) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(RelayError::InvalidState(format!(
                "sender {} already completed",
                self.tag
            )));
        }
        Ok(())
    }
}

impl ResponseSender for RecordingSender {
    fn send_ack(&self) -> Result<()> {
        self.claim()?;
        self.journal.lock().push(Outcome::Ack(self.tag));
        Ok(())
    }

    fn send_failure(&self, err: RelayError) -> Result<()> {
        self.claim()?;
        self.journal
            .lock()
            .push(Outcome::Failure(self.tag, err.to_string()));
        Ok(())
    }
}

/// Poll `probe` until it yields a value.
pub(crate) async fn wait_for<T, F>(mut probe: F) -> T
where
    F: FnMut() -> Option<T>,
{
    let polled = async {
        loop {
            if let Some(v) = probe() {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    tokio::time::timeout(WAIT, polled)
        .await
        .expect("condition not reached in time")
}

/// Poll until `cond` holds.
pub(crate) async fn wait_until<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    wait_for(move || cond().then_some(())).await
}
