use crate::buffers::atomic_map::AtomicMap;
use crate::buffers::buffer_pool::{BufferClass, TieredBufferPool};
use crate::channel::{ChannelError, ChannelLifecycle, ChannelState};
use crate::config::FramingConfig;
use crate::frame_codec::FrameCodec;
use crate::frame_dispatcher::FrameDispatcher;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A point-to-point TCP connection carrying length-delimited frames.
///
/// Inbound bytes are read by a dedicated task that owns the connection's decoder state
///  and feeds decoded frames to the dispatcher in arrival order. Outbound frames are
///  serialized through a per-channel write lock, so concurrent writers cannot interleave
///  partial frames on the wire.
pub struct TcpChannel {
    peer_addr: SocketAddr,
    lifecycle: Arc<ChannelLifecycle>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    buffer_pool: Arc<TieredBufferPool>,
    shutdown: Arc<Notify>,
}

impl TcpChannel {
    /// Connect to a remote endpoint, optionally binding the local side first. On success
    ///  the channel is registered and active, and its read loop is running; the returned
    ///  join handle completes when the connection is fully shut down.
    pub async fn connect(
        remote: SocketAddr,
        local: Option<SocketAddr>,
        dispatcher: Arc<dyn FrameDispatcher>,
        buffer_pool: Arc<TieredBufferPool>,
        config: Arc<FramingConfig>,
    ) -> anyhow::Result<(Arc<TcpChannel>, JoinHandle<()>)> {
        config.validate()?;

        let stream = match local {
            Some(local) => {
                if local.is_ipv4() != remote.is_ipv4() {
                    return Err(ChannelError::AddressType { local, remote }.into());
                }
                let socket = if local.is_ipv4() {
                    TcpSocket::new_v4()?
                }
                else {
                    TcpSocket::new_v6()?
                };
                socket.bind(local)?;
                socket.connect(remote).await?
            }
            None => TcpStream::connect(remote).await?,
        };
        info!("connected to {:?}", remote);

        Self::from_stream(stream, dispatcher, buffer_pool, config).await
    }

    /// wrap an established connection: fire the lifecycle events and start the read loop
    pub(crate) async fn from_stream(
        stream: TcpStream,
        dispatcher: Arc<dyn FrameDispatcher>,
        buffer_pool: Arc<TieredBufferPool>,
        config: Arc<FramingConfig>,
    ) -> anyhow::Result<(Arc<TcpChannel>, JoinHandle<()>)> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let lifecycle = Arc::new(ChannelLifecycle::new(peer_addr, dispatcher.clone()));
        lifecycle.register().await;
        lifecycle.activate().await;

        let shutdown = Arc::new(Notify::new());
        let channel = Arc::new(TcpChannel {
            peer_addr,
            lifecycle: lifecycle.clone(),
            write_half: Mutex::new(Some(write_half)),
            buffer_pool: buffer_pool.clone(),
            shutdown: shutdown.clone(),
        });

        let read_loop = tokio::spawn(read_loop(read_half, lifecycle, dispatcher, buffer_pool, shutdown, config));
        Ok((channel, read_loop))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ChannelState {
        self.lifecycle.state()
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// Write one payload as a single frame. Concurrent calls serialize on the write lock;
    ///  each frame reaches the wire contiguously.
    pub async fn write(&self, payload: &[u8]) -> anyhow::Result<()> {
        let mut write_half = self.write_half.lock().await;
        let write_half = match write_half.as_mut() {
            Some(write_half) => write_half,
            None => anyhow::bail!("channel to {:?} is closed", self.peer_addr),
        };

        let mut buf = self.buffer_pool.get_for_size(FrameCodec::encoded_len(payload.len()));
        FrameCodec::encode_into(payload, &mut buf);

        let result = write_half.write_all(buf.as_ref()).await;
        self.buffer_pool.return_to_pool(buf);
        result?;
        Ok(())
    }

    /// Close the connection cooperatively: shut down the write side and wake the read
    ///  loop, which walks the channel through inactive and unregistered. Idempotent.
    pub async fn disconnect(&self) {
        {
            let mut write_half = self.write_half.lock().await;
            if let Some(mut write_half) = write_half.take() {
                debug!("disconnecting channel to {:?}", self.peer_addr);
                let _ = write_half.shutdown().await;
            }
        }
        self.shutdown.notify_one();
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    lifecycle: Arc<ChannelLifecycle>,
    dispatcher: Arc<dyn FrameDispatcher>,
    buffer_pool: Arc<TieredBufferPool>,
    shutdown: Arc<Notify>,
    config: Arc<FramingConfig>,
) {
    let peer_addr = lifecycle.peer_addr();
    let mut codec = FrameCodec::new(config.max_frame_len);
    let mut received = BytesMut::new();

    'read: loop {
        let mut buf = buffer_pool.get(BufferClass::Medium);
        buf.maximize_len();

        let num_read = tokio::select! {
            result = read_half.read(buf.as_mut()) => match result {
                Ok(0) => {
                    debug!("channel to {:?}: peer closed the connection", peer_addr);
                    break 'read;
                }
                Ok(num_read) => num_read,
                Err(e) => {
                    // a read error on an already-deactivated channel is just the wakeup
                    //  of a cooperative close and is not reported
                    if lifecycle.is_active() {
                        warn!("read error on channel to {:?}: {}", peer_addr, e);
                    }
                    break 'read;
                }
            },
            _ = shutdown.notified() => {
                debug!("channel to {:?}: local disconnect", peer_addr);
                break 'read;
            }
        };
        buf.truncate(num_read);
        received.extend_from_slice(buf.as_ref());
        buffer_pool.return_to_pool(buf);

        loop {
            match codec.decode(&mut received) {
                Ok(Some(frame)) => dispatcher.on_frame(peer_addr, frame).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("protocol error on channel to {:?}: {}", peer_addr, e);
                    break 'read;
                }
            }
        }
        dispatcher.on_read_completed(peer_addr).await;
    }

    // a partially received frame is discarded - nothing is emitted after close
    let _ = codec.decode_eof(&mut received);

    lifecycle.shut_down().await;
}

/// A listening TCP socket that derives one child [`TcpChannel`] per accepted connection.
///
/// The server owns the listening socket exclusively and tracks its live children; each
///  child removes itself from that set when its connection ends. The server has no
///  payload state of its own.
pub struct TcpServerChannel {
    dispatcher: Arc<dyn FrameDispatcher>,
    buffer_pool: Arc<TieredBufferPool>,
    config: Arc<FramingConfig>,
    listener: std::sync::Mutex<Option<Arc<TcpListener>>>,
    bound_addr: std::sync::Mutex<Option<SocketAddr>>,
    children: Arc<AtomicMap<SocketAddr, Arc<TcpChannel>>>,
    close_token: CancellationToken,
}

impl TcpServerChannel {
    pub fn new(
        dispatcher: Arc<dyn FrameDispatcher>,
        buffer_pool: Arc<TieredBufferPool>,
        config: Arc<FramingConfig>,
    ) -> TcpServerChannel {
        TcpServerChannel {
            dispatcher,
            buffer_pool,
            config,
            listener: std::sync::Mutex::new(None),
            bound_addr: std::sync::Mutex::new(None),
            children: Arc::new(AtomicMap::new()),
            close_token: CancellationToken::new(),
        }
    }

    /// Open the listening socket. Exactly one bind is permitted per instance - a second
    ///  call fails with [`ChannelError::AlreadyBound`] even after a close.
    pub async fn bind(&self, local: SocketAddr) -> anyhow::Result<()> {
        self.config.validate()?;
        {
            let mut bound_addr = self.bound_addr.lock().unwrap();
            if let Some(bound) = *bound_addr {
                return Err(ChannelError::AlreadyBound(bound).into());
            }
            // reserve the slot before the await so a concurrent bind cannot slip in
            *bound_addr = Some(local);
        }

        let listener = match TcpListener::bind(local).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.bound_addr.lock().unwrap() = None;
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;
        info!("listening on {:?}", local_addr);

        *self.bound_addr.lock().unwrap() = Some(local_addr);
        *self.listener.lock().unwrap() = Some(Arc::new(listener));
        Ok(())
    }

    /// the actual listening address, once bound - relevant when binding to port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }

    /// Wait for the next incoming connection and derive a child channel for it, already
    ///  registered, active and reading. Returns `Ok(None)` - not an error - if the
    ///  listener is (or gets) closed while waiting. The returned join handle completes
    ///  when the child connection has fully shut down.
    pub async fn accept(&self) -> anyhow::Result<Option<(Arc<TcpChannel>, JoinHandle<()>)>> {
        let listener = match self.listener.lock().unwrap().clone() {
            Some(listener) => listener,
            None => return Ok(None),
        };

        let (stream, peer_addr) = tokio::select! {
            result = listener.accept() => result?,
            _ = self.close_token.cancelled() => return Ok(None),
        };
        debug!("accepted connection from {:?}", peer_addr);

        let (channel, read_loop) =
            TcpChannel::from_stream(stream, self.dispatcher.clone(), self.buffer_pool.clone(), self.config.clone()).await?;

        self.children.update(|m| {
            m.insert(peer_addr, channel.clone());
        });

        let children = self.children.clone();
        let completion = tokio::spawn(async move {
            let _ = read_loop.await;
            children.update(|m| {
                m.remove(&peer_addr);
            });
        });

        Ok(Some((channel, completion)))
    }

    /// the live child channel for a peer address, if its connection is still open
    pub fn child(&self, peer_addr: &SocketAddr) -> Option<Arc<TcpChannel>> {
        self.children.get(peer_addr)
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    pub fn is_active(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }

    /// Release the listening socket and wake any blocked [`Self::accept`]. Live children
    ///  are not affected. Idempotent.
    pub fn close(&self) {
        if let Some(listener) = self.listener.lock().unwrap().take() {
            info!("closing listener on {:?}", listener.local_addr().ok());
        }
        self.close_token.cancel();
    }
}
