use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, info};

use crate::{
    codec::{CodecKind, FrameCodec},
    command::{Command, Response},
    connection::{CloseStart, ConnectionLifecycle, Opened},
    error::{LinkError, Result},
    queue::TransactionQueue,
    transport::{EventReceiver, Transport, TransportEvent},
    types::{LinkConfig, LinkConnectionState, TransactionState},
};

struct LinkInner {
    name: String,
    config: LinkConfig,
    lifecycle: ConnectionLifecycle,
    queue: TransactionQueue,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// One physical connection to one device
///
/// Composes a [`ConnectionLifecycle`], a [`TransactionQueue`] and the frame
/// codec chosen at construction. Any number of tasks may call
/// [`send`](Self::send) concurrently; commands go out one at a time in call
/// order.
///
/// ```no_run
/// use ergolink::{
///     codec::CodecKind,
///     transport::tcp::{TcpConfig, TcpTransport},
///     Command, DeviceLink, LinkConfig,
/// };
///
/// # async fn demo() -> ergolink::Result<()> {
/// let transport = TcpTransport::new(TcpConfig::daum_premium("192.168.1.40"));
/// let link = DeviceLink::with_codec_kind(
///     "8i",
///     transport,
///     CodecKind::Premium,
///     LinkConfig::daum_premium(),
/// );
/// link.connect().await?;
/// let reply = link.send(Command::binary("getProtocolVersion", b"V00".to_vec())).await?;
/// println!("protocol {}", reply.as_text()?);
/// link.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct DeviceLink {
    inner: Arc<LinkInner>,
}

impl DeviceLink {
    /// Build a link from a transport and a codec
    pub fn new<T, C>(name: impl Into<String>, transport: T, codec: C, config: LinkConfig) -> Self
    where
        T: Transport + 'static,
        C: FrameCodec + 'static,
    {
        Self::from_boxed(name, Box::new(transport), Box::new(codec), config)
    }

    /// Build a link using the codec for `kind`
    pub fn with_codec_kind<T>(
        name: impl Into<String>,
        transport: T,
        kind: CodecKind,
        config: LinkConfig,
    ) -> Self
    where
        T: Transport + 'static,
    {
        Self::from_boxed(name, Box::new(transport), kind.build(), config)
    }

    /// Build a link from boxed parts
    pub fn from_boxed(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        codec: Box<dyn FrameCodec>,
        config: LinkConfig,
    ) -> Self {
        let name = name.into();
        debug!("{}: link over {} using {} framing", name, transport.name(), codec.name());
        Self {
            inner: Arc::new(LinkInner {
                lifecycle: ConnectionLifecycle::new(name.clone(), transport, config.open_timeout_ms),
                queue: TransactionQueue::new(
                    name.clone(),
                    codec,
                    config.default_timeout_ms,
                    config.busy_timeout_ms,
                ),
                name,
                config,
                driver: Mutex::new(None),
            }),
        }
    }

    /// Link name used in logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Timeouts this link was built with
    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Open the transport if needed
    ///
    /// # Errors
    ///
    /// See [`ConnectionLifecycle::open`].
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Close the link, cancelling any pending or queued transaction
    ///
    /// Closing a closed link succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Transport`] if the transport failed to close for
    /// a reason other than already being closed.
    pub async fn close(&self) -> Result<()> {
        self.inner.close(false).await
    }

    /// Close the link, ignoring transport close failures
    pub async fn force_close(&self) {
        let _ = self.inner.close(true).await;
    }

    /// Whether the link is connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == LinkConnectionState::Connected
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> LinkConnectionState {
        self.inner.lifecycle.state()
    }

    /// Watch connection state transitions
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LinkConnectionState> {
        self.inner.lifecycle.subscribe()
    }

    /// Number of transactions awaiting a reply (0 or 1)
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.queue.in_flight()
    }

    /// State of the outstanding transaction, if any
    #[must_use]
    pub fn transaction_state(&self) -> Option<TransactionState> {
        self.inner.queue.transaction_state()
    }

    /// Send a command and wait for its reply, using the command's own
    /// timeout or the link default
    ///
    /// # Errors
    ///
    /// Any [`LinkError`]; the link never retries on its own.
    pub async fn send(&self, command: Command) -> Result<Response> {
        self.send_with_timeout(command, None).await
    }

    /// Send a command with an explicit reply deadline
    ///
    /// # Errors
    ///
    /// Any [`LinkError`]; the link never retries on its own.
    pub async fn send_with_timeout(
        &self,
        command: Command,
        timeout_ms: Option<u64>,
    ) -> Result<Response> {
        let inner = &self.inner;
        let enqueued_at = Instant::now();
        let epoch = inner.queue.epoch();

        let _permit = inner.queue.admit(command.log_label()).await?;
        if inner.queue.epoch() != epoch {
            debug!("{}: {} drained while queued", inner.name, command.log_label());
            return Err(LinkError::Cancelled);
        }
        inner.connect().await?;
        inner
            .queue
            .dispatch(&inner.lifecycle, command, timeout_ms, enqueued_at)
            .await
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        if self.inner.lifecycle.state().is_closing_or_closed() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            runtime.spawn(async move {
                let _ = inner.close(true).await;
            });
        }
    }
}

impl LinkInner {
    fn driver_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        match self.lifecycle.open().await? {
            Opened::Existing => Ok(()),
            Opened::Fresh { events, session } => {
                let driver = tokio::spawn(drive(Arc::clone(self), events, session));
                if let Some(previous) = self.driver_slot().replace(driver) {
                    previous.abort();
                }
                Ok(())
            }
        }
    }

    async fn close(&self, force: bool) -> Result<()> {
        match self.lifecycle.begin_close() {
            CloseStart::AlreadyClosed => return Ok(()),
            CloseStart::InProgress => {
                self.lifecycle.wait_closed().await;
                return Ok(());
            }
            CloseStart::Began => {}
        }

        info!("{}: closing", self.name);
        self.queue.cancel_all();
        let closed = self.lifecycle.close_transport().await;
        if let Some(driver) = self.driver_slot().take() {
            driver.abort();
        }
        self.lifecycle.finish_close();

        match closed {
            Err(fault) if !force => Err(LinkError::Transport(fault)),
            _ => Ok(()),
        }
    }

    async fn remote_closed(&self) {
        if self.lifecycle.begin_close() != CloseStart::Began {
            return;
        }
        info!("{}: transport closed by peer", self.name);
        self.queue.cancel_all();
        if let Err(fault) = self.lifecycle.close_transport().await {
            debug!("{}: releasing closed transport: {}", self.name, fault);
        }
        self.driver_slot().take();
        self.lifecycle.finish_close();
    }
}

async fn drive(inner: Arc<LinkInner>, mut events: EventReceiver, session: u64) {
    while let Some(event) = events.recv().await {
        if !inner.lifecycle.is_current(session) {
            debug!("{}: ignoring event from session {}", inner.name, session);
            continue;
        }
        match event {
            TransportEvent::Data(bytes) => {
                debug!("{}: received {:02X?}", inner.name, &bytes[..]);
                inner.queue.on_data(&inner.lifecycle, &bytes).await;
            }
            TransportEvent::Error(fault) => {
                if let Some(fault) = inner.lifecycle.on_transport_error(fault) {
                    if !inner
                        .queue
                        .fail_pending(LinkError::Transport(fault.clone()))
                    {
                        inner.lifecycle.defer(fault);
                    }
                }
            }
            TransportEvent::Closed => break,
        }
    }

    if inner.lifecycle.is_current(session) {
        inner.remote_closed().await;
    } else {
        debug!("{}: driver for retired session {} exiting", inner.name, session);
    }
}
