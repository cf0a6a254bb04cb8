//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storesync_protocol::{BatchDirection, RecordOutcome, SyncBatch};

/// A sync transport exchanges one batch with the remote node.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, RPC, an in-process hub for testing, etc.).
///
/// For a push batch the transport returns one outcome per record it could
/// confirm. For a pull batch the batch carries no records and every
/// returned outcome is an incoming remote record. An `Err` is a
/// whole-batch failure.
pub trait SyncTransport: Send + Sync {
    /// Exchanges `batch`, giving up after `timeout`.
    fn send(&self, batch: &SyncBatch, timeout: Duration) -> SyncResult<Vec<RecordOutcome>>;
}

impl<T: SyncTransport + ?Sized> SyncTransport for Arc<T> {
    fn send(&self, batch: &SyncBatch, timeout: Duration) -> SyncResult<Vec<RecordOutcome>> {
        (**self).send(batch, timeout)
    }
}

/// A scripted reply for [`MockTransport`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return these outcomes.
    Outcomes(Vec<RecordOutcome>),
    /// Fail the whole batch.
    Failure {
        /// Error message.
        message: String,
        /// Whether the failure is transient.
        retryable: bool,
    },
}

type SendHook = Box<dyn Fn(&SyncBatch) + Send + Sync>;

/// A mock transport for testing.
///
/// Replies are scripted per direction. With nothing scripted, a push is
/// accepted in full and a pull returns no changes.
#[derive(Default)]
pub struct MockTransport {
    connected: AtomicBool,
    push_replies: Mutex<VecDeque<MockReply>>,
    pull_replies: Mutex<VecDeque<MockReply>>,
    sent: Mutex<Vec<SyncBatch>>,
    latency: Mutex<Duration>,
    hook: Mutex<Option<SendHook>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Scripts the reply to the next push.
    pub fn reply_to_push(&self, reply: MockReply) {
        self.push_replies.lock().push_back(reply);
    }

    /// Scripts the reply to the next pull.
    pub fn reply_to_pull(&self, reply: MockReply) {
        self.pull_replies.lock().push_back(reply);
    }

    /// Sets the connected state. A disconnected transport fails every
    /// batch with a retryable error.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes every exchange take at least `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Runs `hook` on every batch before replying.
    pub fn on_send(&self, hook: impl Fn(&SyncBatch) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    /// Batches sent so far.
    pub fn sent(&self) -> Vec<SyncBatch> {
        self.sent.lock().clone()
    }

    /// Returns true if the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl SyncTransport for MockTransport {
    fn send(&self, batch: &SyncBatch, _timeout: Duration) -> SyncResult<Vec<RecordOutcome>> {
        self.sent.lock().push(batch.clone());
        if let Some(hook) = self.hook.lock().as_ref() {
            hook(batch);
        }
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if !self.is_connected() {
            return Err(SyncError::transport_retryable("not connected"));
        }

        let scripted = match batch.direction {
            BatchDirection::Push => self.push_replies.lock().pop_front(),
            BatchDirection::Pull => self.pull_replies.lock().pop_front(),
        };
        match scripted {
            Some(MockReply::Outcomes(outcomes)) => Ok(outcomes),
            Some(MockReply::Failure { message, retryable }) => {
                Err(SyncError::Transport { message, retryable })
            }
            None => Ok(match batch.direction {
                BatchDirection::Push => batch
                    .records
                    .iter()
                    .map(|r| RecordOutcome::accepted(r.entity_id.clone()))
                    .collect(),
                BatchDirection::Pull => Vec::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use storesync_protocol::{EntityType, OperationType, StoreId, SyncRecord};

    fn push_batch() -> SyncBatch {
        let mut batch = SyncBatch::new(StoreId::new(), BatchDirection::Push, EntityType::new("product"));
        batch.push_record(SyncRecord::new("p-1", OperationType::Update, b"{}".to_vec(), Utc::now()));
        batch
    }

    #[test]
    fn unscripted_push_is_accepted() {
        let transport = MockTransport::new();
        let outcomes = transport.send(&push_batch(), Duration::from_secs(1)).unwrap();
        assert_eq!(outcomes, vec![RecordOutcome::accepted("p-1")]);
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn scripted_failure_is_returned_once() {
        let transport = MockTransport::new();
        transport.reply_to_push(MockReply::Failure {
            message: "hub busy".into(),
            retryable: true,
        });

        let err = transport.send(&push_batch(), Duration::from_secs(1)).unwrap_err();
        assert!(err.is_retryable());
        assert!(transport.send(&push_batch(), Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn disconnected_transport_fails_retryably() {
        let transport = MockTransport::new();
        transport.set_connected(false);
        assert!(!transport.is_connected());

        let err = transport.send(&push_batch(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SyncError::Transport { retryable: true, .. }));
    }
}
