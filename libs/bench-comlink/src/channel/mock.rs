//! Scripted channel for tests
//!
//! Replies are queued through a [`MockHandle`]; every request is recorded and
//! overlapping exchanges are counted so single-flight behaviour can be asserted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::traits::{Channel, ResponseBoundary};
use crate::error::{LinkError, Result};

/// One scripted reaction to a request
#[derive(Debug, Clone)]
pub enum MockReply {
    Bytes(Vec<u8>),
    Error(LinkError),
    /// Never answer; the exchange times out
    Silence,
}

/// Lifecycle marks of one exchange, in the order they happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEvent {
    Start(usize),
    End(usize),
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    connect_error: Option<LinkError>,
    replies: VecDeque<MockReply>,
    requests: Vec<Vec<u8>>,
    events: Vec<MockEvent>,
    active: usize,
    max_active: usize,
}

/// Test-side view of a [`MockChannel`]
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    pub fn push_reply(&self, bytes: impl Into<Vec<u8>>) {
        self.state.lock().replies.push_back(MockReply::Bytes(bytes.into()));
    }

    pub fn push_error(&self, error: LinkError) {
        self.state.lock().replies.push_back(MockReply::Error(error));
    }

    pub fn push_silence(&self) {
        self.state.lock().replies.push_back(MockReply::Silence);
    }

    /// Make the next connect attempt fail
    pub fn fail_connect(&self, error: LinkError) {
        self.state.lock().connect_error = Some(error);
    }

    /// Simulate the link dropping underneath the session
    pub fn drop_link(&self) {
        self.state.lock().connected = false;
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.lock().requests.clone()
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    /// Highest number of exchanges observed in flight at once
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_active
    }

    /// Exchanges currently in flight
    pub fn in_flight(&self) -> usize {
        self.state.lock().active
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

/// Closes the in-flight mark of an exchange, also when its future is dropped
struct InFlight {
    handle: MockHandle,
    seq: usize,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = self.handle.state.lock();
        state.active -= 1;
        state.events.push(MockEvent::End(self.seq));
    }
}

/// Channel whose replies come from a script
#[derive(Debug)]
pub struct MockChannel {
    handle: MockHandle,
    latency: Duration,
    timeout: Duration,
}

impl MockChannel {
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        let channel = Self {
            handle: handle.clone(),
            latency: Duration::from_millis(5),
            timeout: Duration::from_millis(200),
        };
        (channel, handle)
    }

    /// Time each exchange spends "on the wire"
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(
        &self,
        reply: Option<MockReply>,
        boundary: ResponseBoundary,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            _ = tokio::time::sleep(self.latency) => {},
        }
        if boundary == ResponseBoundary::NoReply {
            return Ok(Vec::new());
        }
        match reply {
            Some(MockReply::Bytes(bytes)) => Ok(bytes),
            Some(MockReply::Error(error)) => Err(error),
            Some(MockReply::Silence) | None => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(LinkError::Cancelled),
                    _ = tokio::time::sleep(self.timeout) => Err(LinkError::timeout(format!(
                        "no response within {} ms",
                        self.timeout.as_millis()
                    ))),
                }
            },
        }
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn channel_type(&self) -> &'static str {
        "mock"
    }

    fn endpoint(&self) -> String {
        "mock".to_string()
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        let mut state = self.handle.state.lock();
        if let Some(error) = state.connect_error.take() {
            return Err(error);
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.handle.state.lock().connected = false;
    }

    async fn exchange(
        &mut self,
        request: &[u8],
        boundary: ResponseBoundary,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let (seq, reply) = {
            let mut state = self.handle.state.lock();
            if !state.connected {
                return Err(LinkError::NotConnected);
            }
            let seq = state.requests.len();
            state.requests.push(request.to_vec());
            state.events.push(MockEvent::Start(seq));
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
            let reply = if boundary == ResponseBoundary::NoReply {
                None
            } else {
                state.replies.pop_front()
            };
            (seq, reply)
        };

        let _in_flight = InFlight {
            handle: self.handle.clone(),
            seq,
        };
        self.run(reply, boundary, cancel).await
    }

    fn is_connected(&self) -> bool {
        self.handle.state.lock().connected
    }
}
