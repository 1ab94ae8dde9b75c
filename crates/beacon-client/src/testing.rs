// In-memory transport plumbing for driving the connection actor in tests.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use beacon_wire::{
    Action, ConnectionDetails, ErrorInfo, ProtocolMessage, RawFrame, WireFormat, decode_frame,
    encode_frame,
};

use crate::transport::{Dialer, Transport, TransportEvent};

/// One dialed mock transport, seen from the test's side: frames the client
/// sends arrive on `outbound`, and the test injects broker behavior through
/// `events`.
pub(crate) struct MockLink {
    pub url: String,
    pub events: mpsc::Sender<TransportEvent>,
    pub outbound: mpsc::UnboundedReceiver<RawFrame>,
    pub destroyed: Arc<AtomicBool>,
}

impl MockLink {
    pub async fn open(&self) {
        self.events
            .send(TransportEvent::Opened)
            .await
            .expect("event channel");
    }

    /// Next frame the client wrote, decoded.
    pub async fn expect_frame(&mut self) -> ProtocolMessage {
        let raw = self.outbound.recv().await.expect("outbound frame");
        decode_frame(&raw, WireFormat::Json).expect("decodable frame")
    }

    /// Deliver a frame as if the broker sent it.
    pub async fn serve(&self, frame: ProtocolMessage) {
        let raw = encode_frame(&frame, WireFormat::Json).expect("encodable frame");
        self.events
            .send(TransportEvent::Frame(raw))
            .await
            .expect("event channel");
    }

    pub async fn drop_connection(&self, reason: Option<ErrorInfo>) {
        self.events
            .send(TransportEvent::Closed(reason))
            .await
            .expect("event channel");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockDialer {
    links: mpsc::UnboundedSender<MockLink>,
    fail_next: AtomicUsize,
}

impl MockDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockLink>) {
        let (links, link_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                links,
                fail_next: AtomicUsize::new(0),
            }),
            link_rx,
        )
    }

    /// Make the next `count` dial attempts fail with a recoverable error.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        url: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn Transport>, ErrorInfo> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                value.checked_sub(1)
            })
            .is_ok()
        {
            return Err(ErrorInfo::new(50_002, 503, "dial refused"));
        }
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let destroyed = Arc::new(AtomicBool::new(false));
        let link = MockLink {
            url: url.to_owned(),
            events,
            outbound,
            destroyed: Arc::clone(&destroyed),
        };
        let _ = self.links.send(link);
        Ok(Box::new(MockTransport {
            outbound: outbound_tx,
            destroyed,
        }))
    }
}

struct MockTransport {
    outbound: mpsc::UnboundedSender<RawFrame>,
    destroyed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: RawFrame) -> Result<(), ErrorInfo> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ErrorInfo::new(80_003, 503, "transport destroyed"));
        }
        self.outbound
            .send(frame)
            .map_err(|_| ErrorInfo::new(80_003, 503, "transport gone"))
    }

    fn destroy(&mut self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// A Connected frame the way a broker would answer a handshake.
pub(crate) fn connected_frame(connection_id: &str, connection_key: &str) -> ProtocolMessage {
    let mut frame = ProtocolMessage::new(Action::Connected);
    frame.connection_id = Some(connection_id.to_owned());
    frame.connection_serial = Some(-1);
    frame.connection_details = Some(ConnectionDetails {
        connection_key: Some(connection_key.to_owned()),
        connection_state_ttl: Some(120_000),
        max_message_size: Some(65_536),
        ..ConnectionDetails::default()
    });
    frame
}

pub(crate) fn attached_frame(channel: &str) -> ProtocolMessage {
    ProtocolMessage::with_channel(Action::Attached, channel)
}

pub(crate) fn ack_frame(serial: i64, count: u32) -> ProtocolMessage {
    let mut frame = ProtocolMessage::new(Action::Ack);
    frame.msg_serial = Some(serial);
    frame.count = Some(count);
    frame
}
