//! In-memory transport for tests: records every call, never touches the network.

use super::transport::{
    DataChannel, DirectConnection, EventSink, Transport, TransportError, TransportEventKind,
};
use crate::core::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateDataChannel(String),
    CreateOffer,
    CreateAnswer,
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Data channel that stores everything sent on it.
pub struct MockDataChannel {
    open: AtomicBool,
    buffered: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
    frames: Mutex<Vec<Frame>>,
}

impl MockDataChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            buffered: AtomicUsize::new(0),
            fail_after: Mutex::new(None),
            frames: Mutex::new(Vec::new()),
        })
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Text(t) => Some(t),
                Frame::Binary(_) => None,
            })
            .collect()
    }

    pub fn binaries(&self) -> Vec<Bytes> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Binary(b) => Some(b),
                Frame::Text(_) => None,
            })
            .collect()
    }

    pub fn set_buffered(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    /// Make every send fail once `n` frames have been accepted.
    pub fn fail_after(&self, n: usize) {
        *self.fail_after.lock().unwrap() = Some(n);
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    fn push(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        let mut frames = self.frames.lock().unwrap();
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if frames.len() >= limit {
                return Err(TransportError::Send("mock failure".into()));
            }
        }
        frames.push(frame);
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> String {
        "chat".into()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.push(Frame::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.push(Frame::Binary(data))
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.set_open(false);
    }
}

/// Connection that records calls and answers with canned SDP.
pub struct MockConnection {
    pub events: EventSink,
    calls: Mutex<Vec<Call>>,
    fail_sdp: AtomicBool,
}

impl MockConnection {
    /// Make `create_offer`/`create_answer` fail (still recorded).
    pub fn fail_sdp(&self, fail: bool) {
        self.fail_sdp.store(fail, Ordering::SeqCst);
    }

    fn sdp_result(&self, desc: SessionDescription) -> Result<SessionDescription, TransportError> {
        if self.fail_sdp.load(Ordering::SeqCst) {
            Err(TransportError::Negotiation("mock sdp failure".into()))
        } else {
            Ok(desc)
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    /// Simulate the channel opening and return it.
    pub fn open_channel(&self) -> Arc<MockDataChannel> {
        let dc = MockDataChannel::new();
        self.events.post(TransportEventKind::ChannelOpen(dc.clone()));
        dc
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl DirectConnection for MockConnection {
    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        self.record(Call::CreateDataChannel(label.to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateOffer);
        self.sdp_result(SessionDescription::offer("mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateAnswer);
        self.sdp_result(SessionDescription::answer("mock-answer"))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(Call::SetRemote(desc));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(Call::AddCandidate(candidate));
        Ok(())
    }

    async fn close(&self) {
        self.record(Call::Close);
    }
}

/// Transport handing out [`MockConnection`]s, kept for inspection.
#[derive(Default)]
pub struct MockTransport {
    connections: Mutex<Vec<(String, Arc<MockConnection>)>>,
    /// Inherited by connections created afterwards.
    fail_sdp: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Most recent connection created for `peer_id`.
    pub fn connection(&self, peer_id: &str) -> Option<Arc<MockConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == peer_id)
            .map(|(_, c)| c.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn fail_sdp(&self, fail: bool) {
        self.fail_sdp.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn DirectConnection>, TransportError> {
        let conn = Arc::new(MockConnection {
            events: events.clone(),
            calls: Mutex::new(Vec::new()),
            fail_sdp: AtomicBool::new(self.fail_sdp.load(Ordering::SeqCst)),
        });
        self.connections
            .lock()
            .unwrap()
            .push((events.peer_id().to_string(), conn.clone()));
        Ok(conn)
    }
}
