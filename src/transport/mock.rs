//! Scriptable in-memory transport.
//!
//! [`MockTransport`] is handed to a link; the paired [`MockHandle`] stays with
//! the test to script device replies, inject asynchronous events and inspect
//! what the link wrote.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use super::{EventSender, Transport, TransportEvent, TransportFault};

/// One scripted reaction to a write
#[derive(Debug, Clone)]
pub struct MockReply {
    /// Pause before the event is delivered, counted from the previous reply
    pub delay_ms: u64,
    /// Event delivered to the link
    pub event: TransportEvent,
}

impl MockReply {
    /// Deliver bytes immediately
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Self::after(0, bytes)
    }

    /// Deliver bytes after `delay_ms`
    pub fn after(delay_ms: u64, bytes: impl Into<Bytes>) -> Self {
        Self {
            delay_ms,
            event: TransportEvent::Data(bytes.into()),
        }
    }

    /// Report a transport fault
    #[must_use]
    pub const fn error(fault: TransportFault) -> Self {
        Self {
            delay_ms: 0,
            event: TransportEvent::Error(fault),
        }
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<MockReply> + Send>;

#[derive(Default)]
struct MockState {
    events: Option<EventSender>,
    open: bool,
    written: Vec<Bytes>,
    open_failure: Option<TransportFault>,
    open_delay_ms: u64,
    write_delay_ms: u64,
    close_failure: Option<TransportFault>,
    write_failure: Option<TransportFault>,
    responder: Option<Responder>,
    opens: usize,
    closes: usize,
}

#[derive(Clone, Default)]
struct Shared(Arc<Mutex<MockState>>);

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory transport driven by a [`MockHandle`]
pub struct MockTransport {
    shared: Shared,
}

/// Test-side control of a [`MockTransport`]
#[derive(Clone)]
pub struct MockHandle {
    shared: Shared,
}

impl MockTransport {
    /// Create a transport and its control handle
    #[must_use]
    pub fn new() -> (Self, MockHandle) {
        let shared = Shared::default();
        (
            Self {
                shared: shared.clone(),
            },
            MockHandle { shared },
        )
    }
}

fn deliver(events: EventSender, replies: Vec<MockReply>) {
    if replies.iter().all(|reply| reply.delay_ms == 0) {
        for reply in replies {
            let _ = events.send(reply.event);
        }
        return;
    }
    tokio::spawn(async move {
        for reply in replies {
            if reply.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(reply.delay_ms)).await;
            }
            if events.send(reply.event).is_err() {
                break;
            }
        }
    });
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&mut self, events: EventSender) -> Result<(), TransportFault> {
        let (delay_ms, failure) = {
            let mut state = self.shared.lock();
            state.opens += 1;
            (state.open_delay_ms, state.open_failure.take())
        };
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if let Some(fault) = failure {
            return Err(fault);
        }

        let mut state = self.shared.lock();
        state.events = Some(events);
        state.open = true;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportFault> {
        let delay_ms = self.shared.lock().write_delay_ms;
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        let (replies, events) = {
            let mut state = self.shared.lock();
            if !state.open {
                return Err(TransportFault::NotOpen);
            }
            if let Some(fault) = state.write_failure.take() {
                return Err(fault);
            }
            state.written.push(Bytes::copy_from_slice(data));
            let replies = state
                .responder
                .as_mut()
                .map(|respond| respond(data))
                .unwrap_or_default();
            (replies, state.events.clone())
        };
        if let Some(events) = events {
            if !replies.is_empty() {
                deliver(events, replies);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportFault> {
        let mut state = self.shared.lock();
        state.closes += 1;
        state.events = None;
        let was_open = std::mem::replace(&mut state.open, false);
        if let Some(fault) = state.close_failure.take() {
            return Err(fault);
        }
        if was_open {
            Ok(())
        } else {
            Err(TransportFault::NotOpen)
        }
    }
}

impl MockHandle {
    /// Reply to every write with the events returned by `responder`
    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<MockReply> + Send + 'static,
    {
        self.shared.lock().responder = Some(Box::new(responder));
    }

    /// Deliver bytes as if the device sent them
    pub fn inject_data(&self, bytes: impl Into<Bytes>) {
        self.inject(TransportEvent::Data(bytes.into()));
    }

    /// Report an asynchronous transport fault
    pub fn inject_error(&self, fault: TransportFault) {
        self.inject(TransportEvent::Error(fault));
    }

    /// Report that the peer closed the connection
    pub fn inject_closed(&self) {
        let events = {
            let mut state = self.shared.lock();
            state.open = false;
            state.events.take()
        };
        if let Some(events) = events {
            let _ = events.send(TransportEvent::Closed);
        }
    }

    fn inject(&self, event: TransportEvent) {
        if let Some(events) = self.shared.lock().events.as_ref() {
            let _ = events.send(event);
        }
    }

    /// Make the next open fail with `fault`
    pub fn fail_next_open(&self, fault: TransportFault) {
        self.shared.lock().open_failure = Some(fault);
    }

    /// Make the next close fail with `fault`
    pub fn fail_next_close(&self, fault: TransportFault) {
        self.shared.lock().close_failure = Some(fault);
    }

    /// Make the next write fail with `fault`
    pub fn fail_next_write(&self, fault: TransportFault) {
        self.shared.lock().write_failure = Some(fault);
    }

    /// Delay every open by `delay_ms`
    pub fn set_open_delay_ms(&self, delay_ms: u64) {
        self.shared.lock().open_delay_ms = delay_ms;
    }

    /// Delay every write by `delay_ms`
    pub fn set_write_delay_ms(&self, delay_ms: u64) {
        self.shared.lock().write_delay_ms = delay_ms;
    }

    /// Every frame written so far, oldest first
    #[must_use]
    pub fn written(&self) -> Vec<Bytes> {
        self.shared.lock().written.clone()
    }

    /// Number of open attempts
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.shared.lock().opens
    }

    /// Number of close calls
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.shared.lock().closes
    }

    /// Whether the transport is currently open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.lock().open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_scripted_reply() {
        let (mut transport, handle) = MockTransport::new();
        handle.respond_with(|written| vec![MockReply::data(written.to_vec())]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();
        transport.write(&[0x11]).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Data(Bytes::from_static(&[0x11])))
        );
        assert_eq!(handle.written(), vec![Bytes::from_static(&[0x11])]);
    }

    #[tokio::test]
    async fn test_open_failure_and_close_without_open() {
        let (mut transport, handle) = MockTransport::new();
        handle.fail_next_open(TransportFault::Io("no such port".to_string()));

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(transport.open(tx).await.is_err());
        assert_eq!(transport.close().await, Err(TransportFault::NotOpen));
        assert_eq!(handle.open_count(), 1);
        assert_eq!(handle.close_count(), 1);
    }
}
