//! Per-chunk completion handles.

use fqr_common::{RelayError, Result};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// One-shot completion handle supplied with every result chunk.
///
/// Exactly one of [`ResponseSender::send_ack`] / [`ResponseSender::send_failure`]
/// is meaningful. Any later call returns [`RelayError::InvalidState`].
pub trait ResponseSender: Send + Sync {
    /// Report that the foreman acknowledged the chunk.
    fn send_ack(&self) -> Result<()>;
    /// Report that the chunk could not be delivered.
    fn send_failure(&self, err: RelayError) -> Result<()>;
}

/// Fail `sender`, swallowing an invalid-state outcome from a lost race.
pub(crate) fn fail_quietly(sender: &dyn ResponseSender, err: RelayError) {
    if let Err(e) = sender.send_failure(err) {
        debug!(error = %e, "response sender already completed; dropping failure");
    }
}

/// Ack `sender`, swallowing an invalid-state outcome from a lost race.
pub(crate) fn ack_quietly(sender: &dyn ResponseSender) {
    if let Err(e) = sender.send_ack() {
        debug!(error = %e, "response sender already completed; dropping ack");
    }
}

/// Sender backed by a tokio oneshot channel.
#[derive(Debug)]
pub struct OneShotResponseSender {
    tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl OneShotResponseSender {
    /// Create a sender and the receiver its caller awaits.
    pub fn channel() -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn complete(&self, outcome: Result<()>) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .take()
            .ok_or_else(|| RelayError::InvalidState("response already sent".to_string()))?;
        // A dropped receiver means the caller stopped waiting; not our error.
        let _ = tx.send(outcome);
        Ok(())
    }
}

impl ResponseSender for OneShotResponseSender {
    fn send_ack(&self) -> Result<()> {
        self.complete(Ok(()))
    }

    fn send_failure(&self, err: RelayError) -> Result<()> {
        self.complete(Err(err))
    }
}
