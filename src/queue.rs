//! Single-outstanding-transaction queue.
//!
//! Callers are admitted one at a time through a fair one-permit semaphore, so
//! dispatch order follows `send()` order. The admitted caller encodes its
//! command, writes it and waits on a oneshot for the driver task to resolve
//! it from decoded bytes. Retries are left to the caller.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{oneshot, Semaphore, SemaphorePermit},
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    codec::{DecodeResult, FrameCodec},
    command::{Command, CommandId, Response},
    connection::ConnectionLifecycle,
    error::{LinkError, Result},
    types::TransactionState,
};

struct PendingTransaction {
    seq: u64,
    command_id: CommandId,
    label: String,
    state: TransactionState,
    enqueued_at: Instant,
    started_at: Instant,
    responder: oneshot::Sender<Result<Response>>,
}

impl PendingTransaction {
    fn finish(mut self, result: Result<Response>) {
        self.state = if result.is_ok() {
            TransactionState::Completed
        } else {
            TransactionState::Failed
        };
        debug!(
            "{} {}: {} after {:?} ({:?} since enqueue)",
            self.label,
            self.command_id,
            self.state,
            self.started_at.elapsed(),
            self.enqueued_at.elapsed()
        );
        if self.responder.send(result).is_err() {
            debug!("{}: caller no longer waiting", self.label);
        }
    }
}

struct Exchange {
    codec: Box<dyn FrameCodec>,
    pending: Option<PendingTransaction>,
}

impl Exchange {
    /// Take the outstanding transaction if its caller is still waiting
    fn take_live(&mut self) -> Option<PendingTransaction> {
        self.codec.reset();
        self.pending.take().filter(|txn| !txn.responder.is_closed())
    }
}

/// Abandons the dispatched transaction when the caller goes away
struct Outstanding<'a> {
    queue: &'a TransactionQueue,
    seq: u64,
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        if self.queue.abandon(self.seq) {
            debug!("{}: transaction {} dropped by its caller", self.queue.name, self.seq);
        }
    }
}

/// Serializes commands on one link
///
/// The exchange lock is never held across an await point.
pub struct TransactionQueue {
    name: String,
    slot: Semaphore,
    exchange: Mutex<Exchange>,
    epoch: AtomicU64,
    next_seq: AtomicU64,
    in_flight: AtomicUsize,
    default_timeout_ms: u64,
    busy_timeout_ms: u64,
}

impl TransactionQueue {
    /// Create an empty queue decoding with `codec`
    pub fn new(
        name: impl Into<String>,
        codec: Box<dyn FrameCodec>,
        default_timeout_ms: u64,
        busy_timeout_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            slot: Semaphore::new(1),
            exchange: Mutex::new(Exchange {
                codec,
                pending: None,
            }),
            epoch: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            default_timeout_ms,
            busy_timeout_ms,
        }
    }

    fn exchange(&self) -> MutexGuard<'_, Exchange> {
        self.exchange.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close generation; bumped every time the queue is drained
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Number of transactions awaiting a reply (0 or 1)
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// State of the outstanding transaction, if any
    #[must_use]
    pub fn transaction_state(&self) -> Option<TransactionState> {
        self.exchange().pending.as_ref().map(|txn| txn.state)
    }

    /// Wait for the transaction slot
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::BusyTimeout`] if the slot did not free up within
    /// the busy timeout. Nothing is written in that case.
    pub async fn admit(&self, label: &str) -> Result<SemaphorePermit<'_>> {
        match timeout(Duration::from_millis(self.busy_timeout_ms), self.slot.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(LinkError::Cancelled),
            Err(_) => {
                warn!(
                    "{}: {} gave up waiting after {}ms",
                    self.name, label, self.busy_timeout_ms
                );
                Err(LinkError::BusyTimeout {
                    label: label.to_string(),
                    busy_timeout_ms: self.busy_timeout_ms,
                })
            }
        }
    }

    /// Encode, write and await the reply to `command`
    ///
    /// The caller must hold the permit returned by [`admit`](Self::admit).
    /// Dropping the returned future abandons the transaction.
    ///
    /// # Errors
    ///
    /// Returns the codec's encode error, the write error, a
    /// [`LinkError::Protocol`] from decoding, [`LinkError::TransactionTimeout`]
    /// or [`LinkError::Cancelled`] if the link closed first.
    pub async fn dispatch(
        &self,
        lifecycle: &ConnectionLifecycle,
        command: Command,
        timeout_ms: Option<u64>,
        enqueued_at: Instant,
    ) -> Result<Response> {
        let timeout_ms = timeout_ms
            .or_else(|| command.timeout_ms())
            .unwrap_or(self.default_timeout_ms);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let label = command.log_label().to_string();
        let (tx, mut rx) = oneshot::channel();

        let frame = {
            let mut exchange = self.exchange();
            exchange.codec.reset();
            let frame = exchange.codec.encode(&command)?;
            let state = exchange.codec.phase();
            exchange.pending = Some(PendingTransaction {
                seq,
                command_id: command.id(),
                label: label.clone(),
                state,
                enqueued_at,
                started_at: Instant::now(),
                responder: tx,
            });
            self.in_flight.store(1, Ordering::SeqCst);
            frame
        };
        let _outstanding = Outstanding { queue: self, seq };

        debug!("{}: {} dispatched", self.name, label);
        if let Err(e) = lifecycle.write(&frame).await {
            if self.abandon(seq) {
                return Err(e);
            }
            // settled while writing, usually cancelled by a close
            return rx.await.unwrap_or(Err(LinkError::Cancelled));
        }

        match timeout(Duration::from_millis(timeout_ms), &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Cancelled),
            Err(_) => {
                if self.abandon(seq) {
                    warn!("{}: {} timed out after {}ms", self.name, label, timeout_ms);
                    return Err(LinkError::TransactionTimeout { label, timeout_ms });
                }
                // settled concurrently with the deadline
                rx.await.unwrap_or(Err(LinkError::Cancelled))
            }
        }
    }

    fn abandon(&self, seq: u64) -> bool {
        let mut exchange = self.exchange();
        if exchange.pending.as_ref().is_some_and(|txn| txn.seq == seq) {
            exchange.pending = None;
            exchange.codec.reset();
            self.in_flight.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Feed bytes that arrived on the transport
    ///
    /// Bytes arriving with no transaction outstanding belong to a completed
    /// or abandoned exchange and are discarded. Handshake bytes requested by
    /// the codec are written before the caller is resolved.
    pub async fn on_data(&self, lifecycle: &ConnectionLifecycle, data: &[u8]) {
        let (reply, completion) = {
            let mut guard = self.exchange();
            let Exchange { codec, pending } = &mut *guard;
            if pending.is_none() {
                debug!("{}: discarding stale bytes {:02X?}", self.name, data);
                return;
            }

            let outcome = match codec.feed(data) {
                DecodeResult::NeedMore => None,
                DecodeResult::Response(body) => Some(Ok(body)),
                DecodeResult::FramingError { kind, detail } => {
                    Some(Err(LinkError::protocol(kind, detail)))
                }
            };
            let reply = codec.take_reply();
            let completion = match outcome {
                None => {
                    if let Some(txn) = pending.as_mut() {
                        txn.state = codec.phase();
                    }
                    None
                }
                Some(result) => {
                    codec.reset();
                    self.in_flight.store(0, Ordering::SeqCst);
                    pending.take().map(|txn| (txn, result))
                }
            };
            (reply, completion)
        };

        if let Some(reply) = reply {
            if let Err(e) = lifecycle.write(&reply).await {
                warn!("{}: failed to write handshake: {}", self.name, e);
            }
        }

        if let Some((txn, result)) = completion {
            let result = result.map(|body| Response::new(txn.command_id, body));
            if let Err(e) = &result {
                warn!("{}: {} failed: {}", self.name, txn.label, e);
            }
            txn.finish(result);
        }
    }

    /// Reject the outstanding transaction with `error`
    ///
    /// Returns `false` if nothing was outstanding or its caller had already
    /// gone away, in which case `error` reached nobody.
    pub fn fail_pending(&self, error: LinkError) -> bool {
        let txn = self.exchange().take_live();
        self.in_flight.store(0, Ordering::SeqCst);
        match txn {
            Some(txn) => {
                warn!("{}: {} failed: {}", self.name, txn.label, error);
                txn.finish(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drain the queue: reject the outstanding transaction and every caller
    /// still waiting for admission with [`LinkError::Cancelled`]
    pub fn cancel_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let txn = self.exchange().take_live();
        self.in_flight.store(0, Ordering::SeqCst);
        if let Some(txn) = txn {
            info!("{}: cancelling {}", self.name, txn.label);
            txn.finish(Err(LinkError::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::FixedLengthCodec,
        error::ProtocolErrorKind,
        transport::{
            mock::{MockHandle, MockTransport},
            TransportFault,
        },
    };
    use std::sync::Arc;

    async fn connected() -> (Arc<ConnectionLifecycle>, MockHandle) {
        let (transport, handle) = MockTransport::new();
        let lifecycle = Arc::new(ConnectionLifecycle::new("test", Box::new(transport), 500));
        lifecycle.open().await.unwrap();
        (lifecycle, handle)
    }

    fn queue(default_timeout_ms: u64, busy_timeout_ms: u64) -> Arc<TransactionQueue> {
        Arc::new(TransactionQueue::new(
            "test",
            Box::new(FixedLengthCodec::new()),
            default_timeout_ms,
            busy_timeout_ms,
        ))
    }

    fn check_cockpit() -> Command {
        Command::binary("checkCockpit", vec![0x10, 0x00]).expect_reply_length(3)
    }

    async fn wait_in_flight(queue: &TransactionQueue) {
        while queue.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_dispatch_resolves_from_data() {
        let (lifecycle, handle) = connected().await;
        let queue = queue(1_000, 1_000);

        let task = {
            let (queue, lifecycle) = (Arc::clone(&queue), Arc::clone(&lifecycle));
            tokio::spawn(async move {
                let _permit = queue.admit("checkCockpit").await?;
                queue
                    .dispatch(&lifecycle, check_cockpit(), None, Instant::now())
                    .await
            })
        };
        wait_in_flight(&queue).await;
        assert_eq!(
            queue.transaction_state(),
            Some(TransactionState::AwaitingFrame)
        );
        queue.on_data(&lifecycle, &[0x10, 0x00]).await;
        queue.on_data(&lifecycle, &[0x01]).await;

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.body(), &[0x10, 0x00, 0x01]);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(handle.written().len(), 1);
    }

    #[tokio::test]
    async fn test_framing_error_rejects() {
        let (lifecycle, _handle) = connected().await;
        let queue = queue(1_000, 1_000);

        let task = {
            let (queue, lifecycle) = (Arc::clone(&queue), Arc::clone(&lifecycle));
            tokio::spawn(async move {
                queue
                    .dispatch(&lifecycle, check_cockpit(), None, Instant::now())
                    .await
            })
        };
        wait_in_flight(&queue).await;
        queue.on_data(&lifecycle, &[0x99, 0x00, 0x01]).await;

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.protocol_kind(), Some(ProtocolErrorKind::IllegalResponse));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_stale_bytes_discarded() {
        let (lifecycle, _handle) = connected().await;
        let queue = queue(200, 1_000);

        let err = queue
            .dispatch(&lifecycle, check_cockpit(), None, Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::TransactionTimeout { timeout_ms: 200, .. }));
        assert_eq!(queue.in_flight(), 0);

        queue.on_data(&lifecycle, &[0x10, 0x00, 0x01]).await;
        assert_eq!(queue.transaction_state(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_timeout() {
        let queue = queue(1_000, 100);
        let _held = queue.admit("first").await.unwrap();
        assert!(matches!(
            queue.admit("second").await,
            Err(LinkError::BusyTimeout { busy_timeout_ms: 100, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_all_rejects_pending() {
        let (lifecycle, _handle) = connected().await;
        let queue = queue(1_000, 1_000);
        let epoch = queue.epoch();

        let task = {
            let (queue, lifecycle) = (Arc::clone(&queue), Arc::clone(&lifecycle));
            tokio::spawn(async move {
                queue
                    .dispatch(&lifecycle, check_cockpit(), None, Instant::now())
                    .await
            })
        };
        wait_in_flight(&queue).await;
        queue.cancel_all();

        assert!(matches!(task.await.unwrap(), Err(LinkError::Cancelled)));
        assert_eq!(queue.epoch(), epoch + 1);
        assert!(!queue.fail_pending(LinkError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_dispatch_releases_transaction() {
        let (lifecycle, _handle) = connected().await;
        let queue = queue(5_000, 1_000);

        let dropped = timeout(
            Duration::from_millis(50),
            queue.dispatch(&lifecycle, check_cockpit(), None, Instant::now()),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.transaction_state(), None);
        assert!(!queue.fail_pending(LinkError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_failing_write_reports_cancelled() {
        let (lifecycle, handle) = connected().await;
        let queue = queue(1_000, 1_000);
        handle.set_write_delay_ms(100);
        handle.fail_next_write(TransportFault::Io("port gone".to_string()));

        let task = {
            let (queue, lifecycle) = (Arc::clone(&queue), Arc::clone(&lifecycle));
            tokio::spawn(async move {
                queue
                    .dispatch(&lifecycle, check_cockpit(), None, Instant::now())
                    .await
            })
        };
        wait_in_flight(&queue).await;
        queue.cancel_all();

        assert!(matches!(task.await.unwrap(), Err(LinkError::Cancelled)));
        assert_eq!(queue.in_flight(), 0);
    }
}
