use crate::buffers::atomic_map::AtomicMap;
use crate::buffers::buffer_pool::{BufferClass, TieredBufferPool};
use crate::channel::{ChannelError, ChannelLifecycle, ChannelState};
use crate::config::FramingConfig;
use crate::frame_codec::FrameCodec;
use crate::frame_dispatcher::FrameDispatcher;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A UDP "connection": either a client channel with its own socket, or a session derived
///  by a [`UdpServerChannel`] for one remote address, multiplexed over the server's
///  shared socket.
///
/// The framing state machine is scoped per channel. UDP gives no delivery or ordering
///  guarantee, so a frame whose continuation never arrives stalls this one session - that
///  is accepted, not mitigated, here.
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    remote_addr: std::sync::Mutex<Option<SocketAddr>>,
    lifecycle: Arc<ChannelLifecycle>,
    write_lock: Mutex<()>,
    buffer_pool: Arc<TieredBufferPool>,
    /// the deriving server's session registry, for self-removal on disconnect
    sessions: Option<Arc<AtomicMap<SocketAddr, Arc<UdpChannel>>>>,
    shutdown: Arc<Notify>,
}

impl UdpChannel {
    /// Create a client channel with a dedicated socket. The local address defaults to the
    ///  wildcard of the remote's address family; a mismatched explicit local address
    ///  fails with [`ChannelError::AddressType`]. The returned join handle completes when
    ///  the channel's read loop has shut down.
    pub async fn connect(
        remote: SocketAddr,
        local: Option<SocketAddr>,
        dispatcher: Arc<dyn FrameDispatcher>,
        buffer_pool: Arc<TieredBufferPool>,
        config: Arc<FramingConfig>,
    ) -> anyhow::Result<(Arc<UdpChannel>, JoinHandle<()>)> {
        config.validate()?;

        let socket = match local {
            Some(local) => {
                if local.is_ipv4() != remote.is_ipv4() {
                    return Err(ChannelError::AddressType { local, remote }.into());
                }
                UdpSocket::bind(local).await?
            }
            None => {
                if remote.is_ipv4() {
                    UdpSocket::bind("0.0.0.0:0").await?
                }
                else {
                    UdpSocket::bind("[::]:0").await?
                }
            }
        };
        let socket = Arc::new(socket);
        info!("UDP channel {:?} -> {:?}", socket.local_addr()?, remote);

        let lifecycle = Arc::new(ChannelLifecycle::new(remote, dispatcher.clone()));
        lifecycle.register().await;
        lifecycle.activate().await;

        let shutdown = Arc::new(Notify::new());
        let channel = Arc::new(UdpChannel {
            socket: socket.clone(),
            remote_addr: std::sync::Mutex::new(Some(remote)),
            lifecycle: lifecycle.clone(),
            write_lock: Mutex::new(()),
            buffer_pool: buffer_pool.clone(),
            sessions: None,
            shutdown: shutdown.clone(),
        });

        let read_loop = tokio::spawn(client_read_loop(socket, lifecycle, dispatcher, buffer_pool, shutdown, config));
        Ok((channel, read_loop))
    }

    /// a session over a server's shared socket - lifecycle events are fired by the caller
    fn for_session(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        dispatcher: Arc<dyn FrameDispatcher>,
        buffer_pool: Arc<TieredBufferPool>,
        sessions: Arc<AtomicMap<SocketAddr, Arc<UdpChannel>>>,
    ) -> Arc<UdpChannel> {
        Arc::new(UdpChannel {
            socket,
            remote_addr: std::sync::Mutex::new(Some(remote)),
            lifecycle: Arc::new(ChannelLifecycle::new(remote, dispatcher)),
            write_lock: Mutex::new(()),
            buffer_pool,
            sessions: Some(sessions),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock().unwrap()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn state(&self) -> ChannelState {
        self.lifecycle.state()
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// Write one payload as a single frame datagram. Fails with
    ///  [`ChannelError::NilAddress`] once the session's remote address is gone.
    pub async fn write(&self, payload: &[u8]) -> anyhow::Result<()> {
        let _write_guard = self.write_lock.lock().await;

        let remote = match self.peer_addr() {
            Some(remote) => remote,
            None => return Err(ChannelError::NilAddress.into()),
        };

        let mut buf = self.buffer_pool.get_for_size(FrameCodec::encoded_len(payload.len()));
        FrameCodec::encode_into(payload, &mut buf);

        let result = self.socket.send_to(buf.as_ref(), remote).await;
        self.buffer_pool.return_to_pool(buf);
        result?;
        Ok(())
    }

    /// End the session / close the client channel: fire the shutdown lifecycle events,
    ///  clear the remote address and deregister from the deriving server. Idempotent.
    pub async fn disconnect(&self) {
        self.shutdown.notify_one();
        self.lifecycle.shut_down().await;

        let remote = self.remote_addr.lock().unwrap().take();
        if let (Some(sessions), Some(remote)) = (&self.sessions, remote) {
            debug!("removing session for {:?}", remote);
            sessions.update(|m| {
                m.remove(&remote);
            });
        }
    }
}

async fn client_read_loop(
    socket: Arc<UdpSocket>,
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
        let mut buf = buffer_pool.get(BufferClass::Large);
        buf.maximize_len();

        let (num_read, from) = tokio::select! {
            result = socket.recv_from(buf.as_mut()) => match result {
                Ok(x) => x,
                Err(e) => {
                    if lifecycle.is_active() {
                        warn!("receive error on UDP channel to {:?}: {}", peer_addr, e);
                    }
                    break 'read;
                }
            },
            _ = shutdown.notified() => {
                debug!("UDP channel to {:?}: local disconnect", peer_addr);
                break 'read;
            }
        };
        if from != peer_addr {
            debug!("dropping datagram from unrelated sender {:?}", from);
            continue;
        }
        buf.truncate(num_read);
        received.extend_from_slice(buf.as_ref());
        buffer_pool.return_to_pool(buf);

        loop {
            match codec.decode(&mut received) {
                Ok(Some(frame)) => dispatcher.on_frame(peer_addr, frame).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("protocol error on UDP channel to {:?}: {}", peer_addr, e);
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

/// decoder state for one session, owned by the server's receive loop
struct SessionDecodeState {
    codec: FrameCodec,
    received: BytesMut,
    last_seen: Instant,
}

impl SessionDecodeState {
    fn new(config: &FramingConfig) -> SessionDecodeState {
        SessionDecodeState {
            codec: FrameCodec::new(config.max_frame_len),
            received: BytesMut::new(),
            last_seen: Instant::now(),
        }
    }
}

/// A bound UDP socket that derives one child [`UdpChannel`] per distinct remote address
///  observed, each modelling an application-level session multiplexed over the shared
///  socket.
///
/// Sessions are created lazily on the first datagram from an address and end on an
///  explicit [`UdpChannel::disconnect`] or - if configured - after an idle timeout.
pub struct UdpServerChannel {
    dispatcher: Arc<dyn FrameDispatcher>,
    buffer_pool: Arc<TieredBufferPool>,
    config: Arc<FramingConfig>,
    socket: std::sync::Mutex<Option<Arc<UdpSocket>>>,
    bound_addr: std::sync::Mutex<Option<SocketAddr>>,
    sessions: Arc<AtomicMap<SocketAddr, Arc<UdpChannel>>>,
    close_token: CancellationToken,
}

impl UdpServerChannel {
    pub fn new(
        dispatcher: Arc<dyn FrameDispatcher>,
        buffer_pool: Arc<TieredBufferPool>,
        config: Arc<FramingConfig>,
    ) -> UdpServerChannel {
        UdpServerChannel {
            dispatcher,
            buffer_pool,
            config,
            socket: std::sync::Mutex::new(None),
            bound_addr: std::sync::Mutex::new(None),
            sessions: Arc::new(AtomicMap::new()),
            close_token: CancellationToken::new(),
        }
    }

    /// Bind the shared socket and start the receive loop. Exactly one bind is permitted
    ///  per instance. The returned join handle completes when the receive loop ends.
    pub async fn bind(&self, local: SocketAddr) -> anyhow::Result<JoinHandle<()>> {
        self.config.validate()?;
        {
            let mut bound_addr = self.bound_addr.lock().unwrap();
            if let Some(bound) = *bound_addr {
                return Err(ChannelError::AlreadyBound(bound).into());
            }
            // reserve the slot before the await so a concurrent bind cannot slip in
            *bound_addr = Some(local);
        }

        let socket = match UdpSocket::bind(local).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                *self.bound_addr.lock().unwrap() = None;
                return Err(e.into());
            }
        };
        let local_addr = socket.local_addr()?;
        info!("bound UDP socket to {:?}", local_addr);

        *self.bound_addr.lock().unwrap() = Some(local_addr);
        *self.socket.lock().unwrap() = Some(socket.clone());

        let receive_loop = tokio::spawn(receive_loop(
            socket,
            self.sessions.clone(),
            self.dispatcher.clone(),
            self.buffer_pool.clone(),
            self.config.clone(),
            self.close_token.clone(),
        ));
        Ok(receive_loop)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }

    /// the live session channel for a remote address, if one is derived
    pub fn session(&self, peer_addr: &SocketAddr) -> Option<Arc<UdpChannel>> {
        self.sessions.get(peer_addr)
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_active(&self) -> bool {
        self.socket.lock().unwrap().is_some()
    }

    /// Release the socket, stop the receive loop and end all live sessions. Idempotent.
    pub async fn close(&self) {
        if self.socket.lock().unwrap().take().is_some() {
            info!("closing UDP server on {:?}", self.local_addr());
        }
        self.close_token.cancel();

        for session in self.sessions.load().values() {
            session.disconnect().await;
        }
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    sessions: Arc<AtomicMap<SocketAddr, Arc<UdpChannel>>>,
    dispatcher: Arc<dyn FrameDispatcher>,
    buffer_pool: Arc<TieredBufferPool>,
    config: Arc<FramingConfig>,
    close_token: CancellationToken,
) {
    info!("starting receive loop");

    let mut decode_states: FxHashMap<SocketAddr, SessionDecodeState> = FxHashMap::default();

    let idle_timeout = config.session_idle_timeout;
    let mut sweep = interval(idle_timeout.unwrap_or(Duration::from_secs(3600)));

    loop {
        let mut buf = buffer_pool.get(BufferClass::Large);
        buf.maximize_len();

        let (num_read, from) = tokio::select! {
            result = socket.recv_from(buf.as_mut()) => match result {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            },
            _ = sweep.tick(), if idle_timeout.is_some() => {
                sweep_idle_sessions(&mut decode_states, &sessions, idle_timeout.unwrap()).await;
                continue;
            }
            _ = close_token.cancelled() => break,
        };
        buf.truncate(num_read);

        // lazily derive a session for a previously unseen (or meanwhile closed) peer
        let channel = match sessions.get(&from) {
            Some(channel) if channel.is_active() => channel,
            _ => {
                debug!("deriving session channel for {:?}", from);
                let channel = UdpChannel::for_session(
                    socket.clone(), from, dispatcher.clone(), buffer_pool.clone(), sessions.clone(),
                );
                channel.lifecycle.register().await;
                channel.lifecycle.activate().await;
                sessions.update(|m| {
                    m.insert(from, channel.clone());
                });
                // decoder state left over from an earlier session must not leak in
                decode_states.insert(from, SessionDecodeState::new(&config));
                channel
            }
        };

        let state = decode_states.entry(from).or_insert_with(|| SessionDecodeState::new(&config));
        state.last_seen = Instant::now();
        state.received.extend_from_slice(buf.as_ref());
        buffer_pool.return_to_pool(buf);

        let mut protocol_error = false;
        loop {
            match state.codec.decode(&mut state.received) {
                Ok(Some(frame)) => dispatcher.on_frame(from, frame).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("protocol error in session {:?}: {}", from, e);
                    protocol_error = true;
                    break;
                }
            }
        }
        if protocol_error {
            decode_states.remove(&from);
            channel.disconnect().await;
            continue;
        }
        dispatcher.on_read_completed(from).await;
    }

    // socket released: end every remaining session
    for session in sessions.load().values() {
        session.disconnect().await;
    }
    decode_states.clear();
}

async fn sweep_idle_sessions(
    decode_states: &mut FxHashMap<SocketAddr, SessionDecodeState>,
    sessions: &AtomicMap<SocketAddr, Arc<UdpChannel>>,
    idle_timeout: Duration,
) {
    let now = Instant::now();
    let expired: Vec<SocketAddr> = decode_states.iter()
        .filter(|(_, state)| now.duration_since(state.last_seen) >= idle_timeout)
        .map(|(&addr, _)| addr)
        .collect();

    for addr in expired {
        debug!("session {:?} idle for more than {:?}: tearing down", addr, idle_timeout);
        decode_states.remove(&addr);
        if let Some(session) = sessions.get(&addr) {
            session.disconnect().await;
        }
    }
}
