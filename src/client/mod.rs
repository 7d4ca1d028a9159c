//! BLE client for the hub.
//!
//! [`BleClient`] owns one connection at a time and layers the hub protocol
//! over a [`GattConnector`]:
//!
//! - **Requests**: [`send_request`](BleClient::send_request) prefixes the
//!   application request type, fragments the message and waits for the
//!   response with the same message id.
//! - **Events**: completed event messages go to listeners registered with
//!   [`add_event_listener`](BleClient::add_event_listener).
//! - **Control**: NACK/BUFFER_FULL reject the matching request, RESET drops
//!   partial messages, MTU_INFO updates the fragment size.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  send_request   ┌──────────────┐  write   ┌──────────┐
//! │ caller     │ ──────────────► │ Session      │ ───────► │ GattLink │
//! │            │ ◄────────────── │ (outbound    │          └────┬─────┘
//! └────────────┘   oneshot       │  lock, MTU)  │               │ LinkEvents
//!        ▲                       └──────────────┘               ▼
//!        │ resolve / reject      ┌──────────────┐  notify  ┌──────────┐
//!        └────────────────────── │ Shared state │ ◄─────── │ pump     │
//!              listeners         │ (pending,    │          │ task     │
//!                                │  reassembly) │          └──────────┘
//!                                └──────────────┘
//! ```
//!
//! The pump task runs for the lifetime of a connection and stops on
//! disconnect through a [`CancellationToken`].
//!
//! # Example
//!
//! ```ignore
//! use megahub_ble::{BleClient, ClientConfig, EventFilter};
//! use megahub_ble::link::BtleplugConnector;
//!
//! let client = BleClient::new(BtleplugConnector::new(Default::default()), ClientConfig::default())?;
//! client.connect().await?;
//! client.add_event_listener(EventFilter::Any, |event| {
//!     println!("event {}: {} bytes", event.app_type, event.data.len());
//!     Ok(())
//! });
//! let projects = client.request(0x07, b"{}").await?;
//! ```

mod error;
mod events;
mod mtu;
mod pending;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, ConfigError};
use crate::link::{GattConnector, GattLink, LinkEvent, LinkEvents};
use crate::protocol::{
    Channel, CompletedMessage, ControlError, ControlMessage, Fragmenter, ProtocolMessageType,
    Reassembler,
};

pub use error::{ClientError, RejectReason};
pub use events::{AppEvent, EventFilter, EventListener, ListenerId, ListenerResult};

use events::EventDispatcher;
use mtu::MtuTracker;
use pending::PendingRequests;

/// Callback fired when a connection ends.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Lock a std mutex, recovering from poisoning.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Client state mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// One live connection.
struct Session<L> {
    link: L,
    mtu: MtuTracker,
    cancel: CancellationToken,
    /// Serializes outbound messages so fragments never interleave.
    outbound: tokio::sync::Mutex<()>,
}

impl<L: GattLink> Session<L> {
    fn new(link: L) -> Self {
        Self {
            link,
            mtu: MtuTracker::new(),
            cancel: CancellationToken::new(),
            outbound: tokio::sync::Mutex::new(()),
        }
    }

    /// Fragment a message and write every fragment to its channel in order.
    async fn send_message(
        &self,
        message_type: ProtocolMessageType,
        message_id: u8,
        body: &[u8],
    ) -> Result<(), ClientError> {
        let channel = match message_type {
            ProtocolMessageType::Request => Channel::Request,
            ProtocolMessageType::Response => Channel::Response,
            ProtocolMessageType::Event => Channel::Event,
            ProtocolMessageType::Control => Channel::Control,
        };

        let _outbound = self.outbound.lock().await;
        let mtu = self.mtu.get();
        let fragments =
            Fragmenter::try_new(usize::from(mtu))?.fragment(message_type, message_id, body)?;
        debug!(
            "Sending {} {} ({} bytes, {} fragments, MTU {})",
            message_type,
            message_id,
            body.len(),
            fragments.len(),
            mtu
        );
        for fragment in &fragments {
            self.link.write(channel, &fragment.to_bytes()).await?;
        }
        Ok(())
    }
}

/// State shared between the client handle and the pump task.
struct Shared<L> {
    session: Mutex<Option<Arc<Session<L>>>>,
    connected: AtomicBool,
    pending: Mutex<PendingRequests>,
    reassembler: Mutex<Reassembler>,
    events: Mutex<EventDispatcher>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
}

impl<L: GattLink + 'static> Shared<L> {
    /// End a session: stop its pump and, if it was the live connection,
    /// fail pending requests, drop partial messages and notify.
    ///
    /// Safe to call repeatedly; only the first call for a live connection
    /// has any effect beyond cancelling the pump.
    fn teardown(&self, session: &Arc<Session<L>>) {
        session.cancel.cancel();
        {
            let mut slot = lock(&self.session);
            if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
                *slot = None;
            }
        }
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        let rejected = lock(&self.pending).reject_all(ClientError::Disconnected);
        lock(&self.reassembler).clear();
        info!("Disconnected ({} pending requests failed)", rejected);

        let callback = lock(&self.on_disconnect).clone();
        if let Some(callback) = callback {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback())).is_err() {
                error!("Disconnect callback panicked");
            }
        }
    }

    fn handle_notification(&self, session: &Session<L>, channel: Channel, data: &[u8]) {
        match channel {
            Channel::Control => self.handle_control(session, data),
            Channel::Response | Channel::Event => {
                let result = lock(&self.reassembler).accept(channel, data);
                match result {
                    Ok(Some(message)) => self.handle_message(message),
                    Ok(None) => {}
                    Err(e) => error!("Dropping {} notification: {}", channel, e),
                }
            }
            Channel::Request => warn!("Ignoring notification on request channel"),
        }
    }

    fn handle_message(&self, message: CompletedMessage) {
        if message.message_type != message.channel.message_type() {
            warn!(
                "{} message {} arrived on {}",
                message.message_type, message.message_id, message.channel
            );
        }
        match message.channel {
            Channel::Response => {
                let message_id = message.message_id;
                let len = message.payload.len();
                if lock(&self.pending).resolve(message_id, message.payload) {
                    debug!("Response {} ({} bytes)", message_id, len);
                } else {
                    warn!("Unmatched response for message id {} ({} bytes)", message_id, len);
                }
            }
            Channel::Event => match AppEvent::from_payload(message.payload) {
                Some(event) => {
                    let listeners = lock(&self.events).listeners_for(event.app_type);
                    if listeners.is_empty() {
                        debug!("No listeners for event type {}", event.app_type);
                    }
                    events::deliver(&event, &listeners);
                }
                None => warn!("Dropping empty event message {}", message.message_id),
            },
            Channel::Request | Channel::Control => {}
        }
    }

    fn handle_control(&self, session: &Session<L>, data: &[u8]) {
        let message = match ControlMessage::parse(data) {
            Ok(message) => message,
            Err(ControlError::Empty) => {
                debug!("Ignoring empty control message");
                return;
            }
            Err(e @ ControlError::UnknownType(_)) => {
                warn!("Ignoring control message: {}", e);
                return;
            }
            Err(e) => {
                error!("Dropping control message: {}", e);
                return;
            }
        };

        match message {
            ControlMessage::Ack { message_id } => debug!("ACK for message {}", message_id),
            ControlMessage::Nack { message_id } => {
                self.reject_request(message_id, RejectReason::Nack)
            }
            ControlMessage::BufferFull { message_id } => {
                self.reject_request(message_id, RejectReason::BufferFull)
            }
            ControlMessage::Retry { message_id } => {
                info!("Device asked to retry message {} (not resent)", message_id)
            }
            ControlMessage::Reset => {
                let mut reassembler = lock(&self.reassembler);
                info!(
                    "Device reset, dropping {} partial messages",
                    reassembler.pending_count()
                );
                reassembler.clear();
            }
            ControlMessage::MtuInfo { mtu } => {
                session.mtu.apply_announced(mtu);
            }
            ControlMessage::RequestMtuInfo => debug!("Ignoring REQUEST_MTU_INFO from device"),
        }
    }

    fn reject_request(&self, message_id: u8, reason: RejectReason) {
        warn!("Device rejected message {}: {}", message_id, reason);
        let error = ClientError::Rejected { message_id, reason };
        if !lock(&self.pending).reject(message_id, error) {
            debug!("No pending request for rejected message {}", message_id);
        }
    }
}

/// Inbound loop for one session.
async fn pump<L: GattLink + 'static>(
    shared: Arc<Shared<L>>,
    session: Arc<Session<L>>,
    mut events: LinkEvents,
) {
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(LinkEvent::Notification { channel, data }) => {
                    shared.handle_notification(&session, channel, &data);
                }
                Some(LinkEvent::Disconnected) | None => {
                    info!("Link lost");
                    shared.teardown(&session);
                    break;
                }
            },
        }
    }
    debug!("Inbound pump stopped");
}

/// Removes a request's pending entry when its caller stops waiting.
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingRequests>,
    message_id: u8,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).retire(self.message_id, self.ticket);
    }
}

/// Client for the hub's BLE protocol.
pub struct BleClient<C: GattConnector> {
    connector: C,
    config: ClientConfig,
    shared: Arc<Shared<C::Link>>,
    /// Serializes connect and disconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

impl<C: GattConnector> BleClient<C> {
    /// Create a disconnected client.
    pub fn new(connector: C, config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let reassembler =
            Reassembler::with_limits(config.reassembly_timeout(), config.max_pending_reassemblies);
        Ok(Self {
            connector,
            shared: Arc::new(Shared {
                session: Mutex::new(None),
                connected: AtomicBool::new(false),
                pending: Mutex::new(PendingRequests::new()),
                reassembler: Mutex::new(reassembler),
                events: Mutex::new(EventDispatcher::default()),
                on_disconnect: Mutex::new(None),
            }),
            config,
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect to the hub and negotiate the MTU.
    ///
    /// Does nothing if already connected.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            debug!("Already connected");
            return Ok(());
        }

        let (link, events) = self
            .connector
            .connect()
            .await
            .map_err(ClientError::Connection)?;
        info!("Link established, negotiating MTU");

        lock(&self.shared.reassembler).clear();
        let session = Arc::new(Session::new(link));
        tokio::spawn(pump(self.shared.clone(), session.clone(), events));

        self.negotiate_mtu(&session).await;

        *lock(&self.shared.session) = Some(session.clone());
        self.shared.connected.store(true, Ordering::SeqCst);
        if session.cancel.is_cancelled() {
            self.shared.connected.store(false, Ordering::SeqCst);
            lock(&self.shared.session).take();
            warn!("Link dropped during MTU negotiation");
            return Err(ClientError::Disconnected);
        }

        info!("Connected (MTU {})", session.mtu.get());
        Ok(())
    }

    async fn negotiate_mtu(&self, session: &Session<C::Link>) {
        if let Some(mtu) = session.mtu.wait_for_announced(self.config.mtu_wait()).await {
            debug!("Device announced MTU {}", mtu);
            return;
        }
        if !self.config.probe_mtu {
            info!("No MTU announced, keeping {}", session.mtu.get());
            return;
        }

        debug!("No MTU announced, probing");
        let _outbound = session.outbound.lock().await;
        let probed = mtu::probe_mtu(&session.link, &self.config.mtu_probe_sizes).await;
        session.mtu.apply_probed(probed);
    }

    /// Close the connection.
    ///
    /// Pending requests fail with [`ClientError::Disconnected`]. Calling this
    /// when not connected is a no-op.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(session) = lock(&self.shared.session).take() else {
            debug!("Already disconnected");
            return Ok(());
        };

        self.shared.teardown(&session);
        if let Err(e) = session.link.disconnect().await {
            warn!("Link disconnect failed: {}", e);
        }
        Ok(())
    }

    /// Whether a connection is open and the link reports itself alive.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
            && lock(&self.shared.session)
                .as_ref()
                .is_some_and(|session| session.link.is_connected())
    }

    /// Current MTU, or `None` when disconnected.
    pub fn mtu(&self) -> Option<u16> {
        lock(&self.shared.session)
            .as_ref()
            .map(|session| session.mtu.get())
    }

    fn active_session(&self) -> Result<Arc<Session<C::Link>>, ClientError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        lock(&self.shared.session)
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    /// Send a request and wait for its response payload.
    ///
    /// The message body is `[app_type] + payload`. The timeout covers both
    /// transmission and the wait for the response.
    pub async fn send_request(
        &self,
        app_type: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ClientError> {
        let session = self.active_session()?;

        let mut body = Vec::with_capacity(payload.len() + 1);
        body.push(app_type);
        body.extend_from_slice(payload);

        let registration = lock(&self.shared.pending).register();
        let message_id = registration.message_id;
        let _guard = PendingGuard {
            pending: &self.shared.pending,
            message_id,
            ticket: registration.ticket,
        };

        let exchange = async {
            if let Err(e) = session
                .send_message(ProtocolMessageType::Request, message_id, &body)
                .await
            {
                debug!("Request {} not sent: {}", message_id, e);
                if session.cancel.is_cancelled() || !session.link.is_connected() {
                    return Err(ClientError::Disconnected);
                }
                return Err(e);
            }
            registration
                .completion
                .await
                .unwrap_or(Err(ClientError::Disconnected))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Request {} (type 0x{:02X}) timed out after {} ms",
                    message_id,
                    app_type,
                    timeout.as_millis()
                );
                Err(ClientError::Timeout {
                    message_id,
                    timeout,
                })
            }
        }
    }

    /// [`send_request`](Self::send_request) with the configured timeout.
    pub async fn request(&self, app_type: u8, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        self.send_request(app_type, payload, self.config.request_timeout())
            .await
    }

    /// [`send_request_with_retry`](Self::send_request_with_retry) with the
    /// configured retry count and timeout.
    pub async fn request_with_retry(
        &self,
        app_type: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        self.send_request_with_retry(
            app_type,
            payload,
            self.config.max_retries,
            self.config.request_timeout(),
        )
        .await
    }

    /// Send a request, retrying with exponential backoff.
    ///
    /// Makes up to `max_retries` attempts (at least one), each with a fresh
    /// message id, and returns the last error if all fail.
    pub async fn send_request_with_retry(
        &self,
        app_type: u8,
        payload: &[u8],
        max_retries: u32,
        timeout: Duration,
    ) -> Result<Vec<u8>, ClientError> {
        let attempts = max_retries.max(1);
        let mut attempt = 0;
        loop {
            let error = match self.send_request(app_type, payload, timeout).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            attempt += 1;
            if attempt >= attempts {
                return Err(error);
            }
            let delay = self.config.retry_delay(attempt - 1);
            warn!(
                "Request type 0x{:02X} failed (attempt {}/{}): {}, retrying in {} ms",
                app_type,
                attempt,
                attempts,
                error,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Write a control message to the control characteristic.
    pub async fn send_control(&self, message: ControlMessage) -> Result<(), ClientError> {
        let session = self.active_session()?;
        let _outbound = session.outbound.lock().await;
        debug!("Sending control {}", message);
        session
            .link
            .write(Channel::Control, &message.to_bytes())
            .await?;
        Ok(())
    }

    /// Register an event listener. Listeners persist across reconnects.
    pub fn add_event_listener<F>(&self, filter: EventFilter, listener: F) -> ListenerId
    where
        F: Fn(&AppEvent) -> ListenerResult + Send + Sync + 'static,
    {
        lock(&self.shared.events).add(filter, Arc::new(listener))
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        lock(&self.shared.events).remove(id)
    }

    /// Set the callback fired once each time a connection ends, replacing
    /// any previous one.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.shared.on_disconnect) = Some(Arc::new(callback));
    }
}

impl<C: GattConnector> Drop for BleClient<C> {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.shared.session).take() {
            session.cancel.cancel();
        }
    }
}
