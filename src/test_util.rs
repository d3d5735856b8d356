//! Helpers for channel tests: a dispatcher that records everything it is fed, with
//!  assertion helpers on the recorded stream.

use crate::frame_dispatcher::FrameDispatcher;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    Frame(Bytes),
    ReadCompleted,
    Registered,
    Active,
    Inactive,
    Unregistered,
}

pub struct RecordingDispatcher {
    sender: mpsc::UnboundedSender<RecordedEvent>,
}

pub struct RecordedEvents {
    receiver: mpsc::UnboundedReceiver<RecordedEvent>,
}

impl RecordingDispatcher {
    pub fn new() -> (RecordingDispatcher, RecordedEvents) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (RecordingDispatcher { sender }, RecordedEvents { receiver })
    }
}

#[async_trait]
impl FrameDispatcher for RecordingDispatcher {
    async fn on_frame(&self, _peer_addr: SocketAddr, payload: Bytes) {
        let _ = self.sender.send(RecordedEvent::Frame(payload));
    }

    async fn on_read_completed(&self, _peer_addr: SocketAddr) {
        let _ = self.sender.send(RecordedEvent::ReadCompleted);
    }

    async fn on_registered(&self, _peer_addr: SocketAddr) {
        let _ = self.sender.send(RecordedEvent::Registered);
    }

    async fn on_active(&self, _peer_addr: SocketAddr) {
        let _ = self.sender.send(RecordedEvent::Active);
    }

    async fn on_inactive(&self, _peer_addr: SocketAddr) {
        let _ = self.sender.send(RecordedEvent::Inactive);
    }

    async fn on_unregistered(&self, _peer_addr: SocketAddr) {
        let _ = self.sender.send(RecordedEvent::Unregistered);
    }
}

impl RecordedEvents {
    /// the next recorded event, waiting for it if necessary
    pub async fn next(&mut self) -> RecordedEvent {
        tokio::time::timeout(Duration::from_secs(5), self.receiver.recv())
            .await
            .expect("timed out waiting for a channel event")
            .expect("event stream ended unexpectedly")
    }

    /// the next frame payload, skipping over other events
    pub async fn expect_frame(&mut self) -> Bytes {
        loop {
            if let RecordedEvent::Frame(payload) = self.next().await {
                return payload;
            }
        }
    }

    /// Wait for the inactive -> unregistered shutdown sequence, skipping whatever came
    ///  before it and asserting that no lifecycle event is interleaved.
    pub async fn expect_shutdown_sequence(&mut self) {
        loop {
            if self.next().await == RecordedEvent::Inactive {
                break;
            }
        }
        loop {
            match self.next().await {
                RecordedEvent::Unregistered => return,
                RecordedEvent::Inactive => panic!("duplicate inactive event"),
                RecordedEvent::Registered | RecordedEvent::Active => panic!("lifecycle restarted after inactive"),
                RecordedEvent::Frame(payload) => panic!("frame {:?} emitted after inactive", payload),
                RecordedEvent::ReadCompleted => {}
            }
        }
    }

    /// the next already-recorded frame without waiting, if any
    pub fn try_next_frame(&mut self) -> Option<Bytes> {
        while let Ok(event) = self.receiver.try_recv() {
            if let RecordedEvent::Frame(payload) = event {
                return Some(payload);
            }
        }
        None
    }
}
