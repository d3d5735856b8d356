use async_trait::async_trait;
use bytes::Bytes;
use framelink::buffers::buffer_pool::TieredBufferPool;
use framelink::config::FramingConfig;
use framelink::frame_dispatcher::FrameDispatcher;
use framelink::frame_queue::{FrameQueue, QueueDispatcher};
use framelink::tcp_channel::{TcpChannel, TcpServerChannel};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, Level};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = Arc::new(FramingConfig::default());
    let pool = Arc::new(TieredBufferPool::new(
        config.small_buffer_size,
        config.medium_buffer_size,
        config.large_buffer_size,
        config.buffer_pool_capacity,
    ));

    // server side: decoded frames are handed off through a queue, and an echo task
    //  writes each one back to the channel it came from
    let inbound = Arc::new(FrameQueue::new());
    let server = Arc::new(TcpServerChannel::new(
        Arc::new(QueueDispatcher::new(inbound.clone())),
        pool.clone(),
        config.clone(),
    ));
    server.bind(SocketAddr::from_str("127.0.0.1:9100")?).await?;
    let server_addr = server.local_addr().expect("server was bound above");

    {
        let server = server.clone();
        tokio::spawn(async move {
            while let Ok(Some((channel, _))) = server.accept().await {
                info!("accepted {:?}", channel.peer_addr());
            }
        });
    }

    {
        let server = server.clone();
        let inbound = inbound.clone();
        tokio::spawn(async move {
            loop {
                match inbound.pop() {
                    Some((peer_addr, payload)) => {
                        if let Some(channel) = server.child(&peer_addr) {
                            let _ = channel.write(&payload).await;
                        }
                    }
                    None => sleep(Duration::from_millis(1)).await,
                }
            }
        });
    }

    // client side
    let (client, _read_loop) = TcpChannel::connect(
        server_addr,
        None,
        Arc::new(PrintingDispatcher),
        pool.clone(),
        config.clone(),
    ).await?;

    client.write(b"hello").await?;
    client.write(b"framed world").await?;
    client.write(b"").await?;

    sleep(Duration::from_millis(100)).await;

    client.disconnect().await;
    server.close();
    Ok(())
}

struct PrintingDispatcher;

#[async_trait]
impl FrameDispatcher for PrintingDispatcher {
    async fn on_frame(&self, peer_addr: SocketAddr, payload: Bytes) {
        info!("echo from {:?}: {:?}", peer_addr, payload);
    }

    async fn on_read_completed(&self, _peer_addr: SocketAddr) {}
    async fn on_registered(&self, _peer_addr: SocketAddr) {}

    async fn on_active(&self, peer_addr: SocketAddr) {
        info!("connected to {:?}", peer_addr);
    }

    async fn on_inactive(&self, _peer_addr: SocketAddr) {}

    async fn on_unregistered(&self, peer_addr: SocketAddr) {
        info!("connection to {:?} fully closed", peer_addr);
    }
}
