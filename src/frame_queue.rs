use crate::frame_dispatcher::FrameDispatcher;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// A FIFO queue serialized by a single mutex, safe for concurrent use by any number of
///  channels. Queue depth in this system is small (it hands decoded frames from read
///  loops to a consumer, it is not a bulk pipeline), so one mutex beats the complexity of
///  separate reader / writer locks.
pub struct FrameQueue<T> {
    entries: Mutex<VecDeque<T>>,
}

impl<T> FrameQueue<T> {
    pub fn new() -> FrameQueue<T> {
        FrameQueue {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, value: T) {
        self.entries.lock().unwrap()
            .push_back(value);
    }

    /// the oldest element, or `None` if the queue is empty
    pub fn pop(&self) -> Option<T> {
        self.entries.lock().unwrap()
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for FrameQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`FrameDispatcher`] that hands every decoded frame off to a shared [`FrameQueue`],
///  for consumers that poll rather than react.
pub struct QueueDispatcher {
    queue: Arc<FrameQueue<(SocketAddr, Bytes)>>,
}

impl QueueDispatcher {
    pub fn new(queue: Arc<FrameQueue<(SocketAddr, Bytes)>>) -> QueueDispatcher {
        QueueDispatcher { queue }
    }
}

#[async_trait]
impl FrameDispatcher for QueueDispatcher {
    async fn on_frame(&self, peer_addr: SocketAddr, payload: Bytes) {
        self.queue.push((peer_addr, payload));
    }

    async fn on_read_completed(&self, _peer_addr: SocketAddr) {}
    async fn on_registered(&self, _peer_addr: SocketAddr) {}
    async fn on_active(&self, _peer_addr: SocketAddr) {}
    async fn on_inactive(&self, _peer_addr: SocketAddr) {}
    async fn on_unregistered(&self, _peer_addr: SocketAddr) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new();

        for i in 0..100 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 100);

        for i in 0..100 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_pop_empty() {
        let queue: FrameQueue<u32> = FrameQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_interleaved() {
        let queue = FrameQueue::new();

        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), Some(1));
        queue.push(3);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[tokio::test]
    async fn test_queue_dispatcher() {
        let queue = Arc::new(FrameQueue::new());
        let dispatcher = QueueDispatcher::new(queue.clone());

        let peer_addr = SocketAddr::from_str("127.0.0.1:9000").unwrap();
        dispatcher.on_frame(peer_addr, Bytes::from_static(b"a")).await;
        dispatcher.on_frame(peer_addr, Bytes::from_static(b"b")).await;
        dispatcher.on_read_completed(peer_addr).await;

        assert_eq!(queue.pop(), Some((peer_addr, Bytes::from_static(b"a"))));
        assert_eq!(queue.pop(), Some((peer_addr, Bytes::from_static(b"b"))));
        assert_eq!(queue.pop(), None);
    }
}
