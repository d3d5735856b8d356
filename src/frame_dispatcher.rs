use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

/// The per-connection event sink that the channels feed, introduced as a trait seam so the
///  handler framework (or a test mock) can be plugged in behind it.
///
/// For one connection, all calls happen from that connection's single read loop, in byte
///  stream order. Calls for different connections can happen concurrently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameDispatcher: Send + Sync + 'static {
    /// one fully decoded frame payload
    async fn on_frame(&self, peer_addr: SocketAddr, payload: Bytes);

    /// all frames decodable from the bytes read so far have been dispatched
    async fn on_read_completed(&self, peer_addr: SocketAddr);

    async fn on_registered(&self, peer_addr: SocketAddr);
    async fn on_active(&self, peer_addr: SocketAddr);
    async fn on_inactive(&self, peer_addr: SocketAddr);
    async fn on_unregistered(&self, peer_addr: SocketAddr);
}
