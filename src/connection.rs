//! Open/close state machine around a [`Transport`].

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    error::{LinkError, Result},
    transport::{EventReceiver, Transport, TransportFault},
    types::LinkConnectionState,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of a successful [`ConnectionLifecycle::open`]
#[derive(Debug)]
pub enum Opened {
    /// This call opened the transport; the caller owns its event stream
    Fresh {
        /// Events produced by the freshly opened transport
        events: EventReceiver,
        /// Session number of this open
        session: u64,
    },
    /// The link was already connected, or another caller opened it
    Existing,
}

/// How a close request relates to the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseStart {
    /// Link was idle or disconnected
    AlreadyClosed,
    /// Another close is running
    InProgress,
    /// This call moved the link to `Disconnecting`
    Began,
}

/// Settles an open whose owner was dropped before it finished
///
/// The transport may be half open; the next open starts from `Error` and
/// closes it first.
struct OpenAttempt<'a> {
    lifecycle: &'a ConnectionLifecycle,
    settled: bool,
}

impl Drop for OpenAttempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let lifecycle = self.lifecycle;
        let abandoned = lifecycle.state.send_if_modified(|state| {
            if *state == LinkConnectionState::Connecting {
                *lock(&lifecycle.last_error) = Some("open abandoned".to_string());
                *state = LinkConnectionState::Error;
                true
            } else {
                false
            }
        });
        if abandoned {
            warn!("{}: open abandoned by its caller", lifecycle.name);
        }
    }
}

/// Connection state machine for one link
///
/// Owns the transport exclusively. Concurrent [`open`](Self::open) calls
/// share the outcome of the single caller that actually opens the transport.
pub struct ConnectionLifecycle {
    name: String,
    transport: AsyncMutex<Box<dyn Transport>>,
    state: watch::Sender<LinkConnectionState>,
    last_error: Mutex<Option<String>>,
    deferred: Mutex<Option<TransportFault>>,
    session: AtomicU64,
    open_timeout: Duration,
}

impl ConnectionLifecycle {
    /// Wrap `transport`; the link starts `Idle`
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>, open_timeout_ms: u64) -> Self {
        Self {
            name: name.into(),
            transport: AsyncMutex::new(transport),
            state: watch::Sender::new(LinkConnectionState::Idle),
            last_error: Mutex::new(None),
            deferred: Mutex::new(None),
            session: AtomicU64::new(0),
            open_timeout: Duration::from_millis(open_timeout_ms),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LinkConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LinkConnectionState> {
        self.state.subscribe()
    }

    /// Reason of the last failed open or fault, if any
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    pub(crate) fn is_current(&self, session: u64) -> bool {
        self.session.load(Ordering::SeqCst) == session
    }

    pub(crate) fn transition(&self, to: LinkConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            debug!("{}: {} -> {}", self.name, from, to);
        }
    }

    fn enter_error(&self, reason: String) {
        *lock(&self.last_error) = Some(reason);
        self.transition(LinkConnectionState::Error);
    }

    /// Open the transport unless already connected
    ///
    /// # Errors
    ///
    /// - [`LinkError::Transport`] if a fault reported while no transaction was
    ///   pending has not been surfaced yet
    /// - [`LinkError::Connection`] if the transport failed to open or did not
    ///   open within the open timeout
    /// - [`LinkError::Cancelled`] if the link was closed while opening
    pub async fn open(&self) -> Result<Opened> {
        loop {
            if self.state() == LinkConnectionState::Error {
                if let Some(fault) = lock(&self.deferred).take() {
                    return Err(LinkError::Transport(fault));
                }
            }

            let mut claimed_from = None;
            self.state.send_if_modified(|state| {
                if state.can_open() {
                    claimed_from = Some(*state);
                    *state = LinkConnectionState::Connecting;
                    true
                } else {
                    false
                }
            });
            if let Some(previous) = claimed_from {
                debug!("{}: {} -> {}", self.name, previous, LinkConnectionState::Connecting);
                return self.open_as_owner(previous).await;
            }

            match self.state() {
                LinkConnectionState::Connected => return Ok(Opened::Existing),
                LinkConnectionState::Connecting => {
                    let settled = self.wait_while(LinkConnectionState::Connecting).await;
                    if settled == LinkConnectionState::Connected {
                        return Ok(Opened::Existing);
                    }
                    return Err(LinkError::connection(
                        self.last_error().unwrap_or_else(|| format!("link is {settled}")),
                    ));
                }
                LinkConnectionState::Disconnecting => {
                    self.wait_while(LinkConnectionState::Disconnecting).await;
                }
                _ => {}
            }
        }
    }

    async fn open_as_owner(&self, previous: LinkConnectionState) -> Result<Opened> {
        let mut attempt = OpenAttempt {
            lifecycle: self,
            settled: false,
        };
        let mut transport = self.transport.lock().await;
        if previous == LinkConnectionState::Error {
            if let Err(fault) = transport.close().await {
                debug!("{}: ignoring close fault before reopen: {}", self.name, fault);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        info!("{}: opening {}", self.name, transport.name());
        let opened = timeout(self.open_timeout, transport.open(tx)).await;
        attempt.settled = true;
        let reason = match opened {
            Ok(Ok(())) => {
                let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
                let promoted = self.state.send_if_modified(|state| {
                    if *state == LinkConnectionState::Connecting {
                        *state = LinkConnectionState::Connected;
                        true
                    } else {
                        false
                    }
                });
                if !promoted {
                    debug!("{}: closed while opening", self.name);
                    return Err(LinkError::Cancelled);
                }
                *lock(&self.last_error) = None;
                info!("{}: connected (session {})", self.name, session);
                return Ok(Opened::Fresh {
                    events: rx,
                    session,
                });
            }
            Ok(Err(fault)) => fault.to_string(),
            Err(_) => {
                if let Err(fault) = transport.close().await {
                    debug!("{}: ignoring close fault after open timeout: {}", self.name, fault);
                }
                "timeout".to_string()
            }
        };
        drop(transport);

        warn!("{}: open failed: {}", self.name, reason);
        *lock(&self.last_error) = Some(reason.clone());
        self.state.send_if_modified(|state| {
            if *state == LinkConnectionState::Connecting {
                *state = LinkConnectionState::Error;
                true
            } else {
                false
            }
        });
        Err(LinkError::Connection { reason })
    }

    async fn wait_while(&self, state: LinkConnectionState) -> LinkConnectionState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(|current| *current != state).await {
            Ok(current) => *current,
            Err(_) => self.state(),
        };
        settled
    }

    /// Write raw bytes to the connected transport
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Connection`] if the link is not connected and
    /// [`LinkError::Transport`] if the write fails, which also moves the link
    /// to `Error`.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let state = self.state();
        if state != LinkConnectionState::Connected {
            return Err(LinkError::connection(format!("link is {state}")));
        }
        let mut transport = self.transport.lock().await;
        debug!("{}: sending {:02X?}", self.name, data);
        if let Err(fault) = transport.write(data).await {
            drop(transport);
            warn!("{}: write failed: {}", self.name, fault);
            if !self.state().is_closing_or_closed() {
                self.enter_error(fault.to_string());
            }
            return Err(LinkError::Transport(fault));
        }
        Ok(())
    }

    /// Filter an asynchronous transport fault
    ///
    /// Faults raised while the link is closing or closed are swallowed and
    /// `None` is returned. Any other fault moves the link to `Error` and is
    /// handed back for routing.
    pub fn on_transport_error(&self, fault: TransportFault) -> Option<TransportFault> {
        let state = self.state();
        if state.is_closing_or_closed() {
            debug!("{}: swallowing '{}' while {}", self.name, fault, state);
            return None;
        }
        warn!("{}: transport fault: {}", self.name, fault);
        self.enter_error(fault.to_string());
        Some(fault)
    }

    /// Keep a fault for the next `open()` caller
    pub fn defer(&self, fault: TransportFault) {
        debug!("{}: deferring '{}' to next caller", self.name, fault);
        *lock(&self.deferred) = Some(fault);
    }

    pub(crate) fn begin_close(&self) -> CloseStart {
        let mut start = CloseStart::AlreadyClosed;
        self.state.send_if_modified(|state| match state {
            LinkConnectionState::Idle | LinkConnectionState::Disconnected => false,
            LinkConnectionState::Disconnecting => {
                start = CloseStart::InProgress;
                false
            }
            _ => {
                debug!("{}: {} -> {}", self.name, state, LinkConnectionState::Disconnecting);
                *state = LinkConnectionState::Disconnecting;
                start = CloseStart::Began;
                true
            }
        });
        start
    }

    pub(crate) async fn wait_closed(&self) {
        self.wait_while(LinkConnectionState::Disconnecting).await;
    }

    /// Flush and close the transport, swallowing faults that merely report it
    /// is already closed
    pub(crate) async fn close_transport(&self) -> std::result::Result<(), TransportFault> {
        let mut transport = self.transport.lock().await;
        match transport.close().await {
            Ok(()) => Ok(()),
            Err(fault) if fault.is_close_side_effect() => {
                debug!("{}: swallowing '{}' on close", self.name, fault);
                Ok(())
            }
            Err(fault) => {
                warn!("{}: close failed: {}", self.name, fault);
                Err(fault)
            }
        }
    }

    /// Settle in `Disconnected` and retire the current session
    pub(crate) fn finish_close(&self) {
        self.session.fetch_add(1, Ordering::SeqCst);
        lock(&self.deferred).take();
        self.transition(LinkConnectionState::Disconnected);
        info!("{}: disconnected", self.name);
    }
}
