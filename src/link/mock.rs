//! In-memory hub for client tests.
//!
//! [`MockConnector`] hands out [`MockLink`]s; the paired [`MockPeer`] plays
//! the device side: it records writes, reassembles requests, answers them
//! through an optional responder and can push arbitrary notifications or
//! drop the link.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{GattConnector, GattLink, LinkError, LinkEvent, LinkEvents};
use crate::protocol::{
    Channel, CompletedMessage, ControlMessage, Fragmenter, ProtocolMessageType, Reassembler,
};

/// What the simulated device does with a completed request.
pub(crate) enum Reply {
    /// Send a fragmented response with the same message id.
    Response(Vec<u8>),
    /// Send a control message.
    Control(ControlMessage),
    /// Stay silent.
    Silent,
}

type Responder = Box<dyn Fn(&CompletedMessage) -> Reply + Send + Sync>;

struct PeerState {
    fail_connect: Option<LinkError>,
    fail_writes: bool,
    max_write_len: Option<usize>,
    mtu_on_connect: Option<u16>,
    peer_mtu: usize,
    writes: Vec<(Channel, Vec<u8>)>,
    requests: Vec<CompletedMessage>,
    reassembler: Reassembler,
    responder: Option<Responder>,
    events: Option<mpsc::UnboundedSender<LinkEvent>>,
    connected: Arc<AtomicBool>,
}

struct Shared {
    state: Mutex<PeerState>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    write_attempts: AtomicUsize,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Creates a connector and the peer handle that drives it.
pub(crate) fn pair() -> (MockConnector, MockPeer) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PeerState {
            fail_connect: None,
            fail_writes: false,
            max_write_len: None,
            mtu_on_connect: None,
            peer_mtu: 23,
            writes: Vec::new(),
            requests: Vec::new(),
            reassembler: Reassembler::new(Duration::from_secs(60)),
            responder: None,
            events: None,
            connected: Arc::new(AtomicBool::new(false)),
        }),
        connects: AtomicUsize::new(0),
        disconnects: AtomicUsize::new(0),
        write_attempts: AtomicUsize::new(0),
    });
    (
        MockConnector {
            shared: shared.clone(),
        },
        MockPeer { shared },
    )
}

pub(crate) struct MockConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl GattConnector for MockConnector {
    type Link = MockLink;

    async fn connect(&self) -> Result<(MockLink, LinkEvents), LinkError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let mut state = self.shared.state();
        if let Some(err) = state.fail_connect.clone() {
            return Err(err);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(mtu) = state.mtu_on_connect {
            let _ = tx.send(LinkEvent::Notification {
                channel: Channel::Control,
                data: ControlMessage::MtuInfo { mtu }.to_bytes(),
            });
        }
        let connected = Arc::new(AtomicBool::new(true));
        state.connected = connected.clone();
        state.events = Some(tx);
        state.reassembler.clear();

        Ok((
            MockLink {
                shared: self.shared.clone(),
                connected,
            },
            rx,
        ))
    }
}

pub(crate) struct MockLink {
    shared: Arc<Shared>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl GattLink for MockLink {
    async fn write(&self, channel: Channel, data: &[u8]) -> Result<(), LinkError> {
        self.shared.write_attempts.fetch_add(1, Ordering::SeqCst);
        // Give concurrent writers a chance to interleave
        tokio::task::yield_now().await;

        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }

        let mut state = self.shared.state();
        if state.fail_writes {
            return Err(LinkError::WriteFailed("mock write failure".into()));
        }
        if let Some(max) = state.max_write_len {
            if data.len() > max {
                return Err(LinkError::WriteFailed(format!(
                    "{} bytes exceeds {}",
                    data.len(),
                    max
                )));
            }
        }
        state.writes.push((channel, data.to_vec()));

        if channel == Channel::Request {
            // Probe writes and other junk fail to parse and are ignored
            if let Ok(Some(request)) = state.reassembler.accept(Channel::Request, data) {
                let reply = state
                    .responder
                    .as_ref()
                    .map(|respond| respond(&request))
                    .unwrap_or(Reply::Silent);
                let message_id = request.message_id;
                state.requests.push(request);
                deliver(&state, message_id, reply);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn deliver(state: &PeerState, message_id: u8, reply: Reply) {
    let Some(tx) = state.events.as_ref() else {
        return;
    };
    match reply {
        Reply::Response(payload) => {
            let fragments = Fragmenter::try_new(state.peer_mtu)
                .and_then(|f| f.fragment(ProtocolMessageType::Response, message_id, &payload))
                .unwrap_or_default();
            for fragment in fragments {
                let _ = tx.send(LinkEvent::Notification {
                    channel: Channel::Response,
                    data: fragment.to_bytes(),
                });
            }
        }
        Reply::Control(message) => {
            let _ = tx.send(LinkEvent::Notification {
                channel: Channel::Control,
                data: message.to_bytes(),
            });
        }
        Reply::Silent => {}
    }
}

/// Device-side handle used by tests.
#[derive(Clone)]
pub(crate) struct MockPeer {
    shared: Arc<Shared>,
}

impl MockPeer {
    pub fn fail_connect(&self, err: Option<LinkError>) {
        self.shared.state().fail_connect = err;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.shared.state().fail_writes = fail;
    }

    /// Reject writes larger than `max` bytes, as a link with a small MTU would.
    pub fn max_write_len(&self, max: Option<usize>) {
        self.shared.state().max_write_len = max;
    }

    /// Push MTU_INFO immediately after every connect.
    pub fn mtu_on_connect(&self, mtu: Option<u16>) {
        self.shared.state().mtu_on_connect = mtu;
    }

    /// MTU the device uses when fragmenting responses.
    pub fn peer_mtu(&self, mtu: usize) {
        self.shared.state().peer_mtu = mtu;
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&CompletedMessage) -> Reply + Send + Sync + 'static,
    {
        self.shared.state().responder = Some(Box::new(responder));
    }

    /// Push a raw notification.
    pub fn notify(&self, channel: Channel, data: Vec<u8>) {
        if let Some(tx) = self.shared.state().events.as_ref() {
            let _ = tx.send(LinkEvent::Notification { channel, data });
        }
    }

    pub fn send_control(&self, message: ControlMessage) {
        self.notify(Channel::Control, message.to_bytes());
    }

    /// Fragment and push a message with the device's MTU.
    pub fn send_message(&self, channel: Channel, message_id: u8, payload: &[u8]) {
        let mtu = self.shared.state().peer_mtu;
        let fragments = Fragmenter::try_new(mtu)
            .and_then(|f| f.fragment(channel.message_type(), message_id, payload))
            .unwrap_or_default();
        for fragment in fragments {
            self.notify(channel, fragment.to_bytes());
        }
    }

    /// Push an event with the given application type.
    pub fn send_event(&self, message_id: u8, app_type: u8, data: &[u8]) {
        let mut payload = vec![app_type];
        payload.extend_from_slice(data);
        self.send_message(Channel::Event, message_id, &payload);
    }

    /// Simulate a peer-initiated disconnect.
    pub fn drop_link(&self) {
        let state = self.shared.state();
        state.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = state.events.as_ref() {
            let _ = tx.send(LinkEvent::Disconnected);
        }
    }

    pub fn writes(&self, channel: Channel) -> Vec<Vec<u8>> {
        self.shared
            .state()
            .writes
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Requests the device has fully reassembled, in completion order.
    pub fn requests(&self) -> Vec<CompletedMessage> {
        self.shared.state().requests.clone()
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.shared.disconnects.load(Ordering::SeqCst)
    }

    pub fn write_attempts(&self) -> usize {
        self.shared.write_attempts.load(Ordering::SeqCst)
    }
}
