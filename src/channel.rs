use crate::frame_dispatcher::FrameDispatcher;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Typed errors for configuration / usage mistakes at the channel boundary. These are
///  returned synchronously from the call that detected them and never panic the caller.
///  They travel inside `anyhow::Error` and can be matched via `downcast_ref`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("address family mismatch: local address {local} and remote address {remote}")]
    AddressType { local: SocketAddr, remote: SocketAddr },

    #[error("channel is already bound to {0}")]
    AlreadyBound(SocketAddr),

    #[error("channel has no remote address")]
    NilAddress,
}

/// A channel's lifecycle position: `Unregistered -> Registered -> Active -> Inactive ->
///  Unregistered`, with `Unregistered` being both the initial and the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unregistered,
    Registered,
    Active,
    Inactive,
}

impl ChannelState {
    fn from_raw(raw: u8) -> ChannelState {
        match raw {
            0 => ChannelState::Unregistered,
            1 => ChannelState::Registered,
            2 => ChannelState::Active,
            3 => ChannelState::Inactive,
            _ => unreachable!("lifecycle state is only ever written from ChannelState values"),
        }
    }

    fn raw(self) -> u8 {
        match self {
            ChannelState::Unregistered => 0,
            ChannelState::Registered => 1,
            ChannelState::Active => 2,
            ChannelState::Inactive => 3,
        }
    }
}

/// Tracks one channel's lifecycle state and fires the corresponding dispatcher events.
///
/// Transitions are compare-and-swap guarded, so each one happens (and fires its event)
///  at most once even when a local disconnect races the read loop's own shutdown path -
///  whichever side loses the race becomes a no-op.
pub struct ChannelLifecycle {
    peer_addr: SocketAddr,
    state: AtomicU8,
    dispatcher: Arc<dyn FrameDispatcher>,
}

impl ChannelLifecycle {
    pub fn new(peer_addr: SocketAddr, dispatcher: Arc<dyn FrameDispatcher>) -> ChannelLifecycle {
        ChannelLifecycle {
            peer_addr,
            state: AtomicU8::new(ChannelState::Unregistered.raw()),
            dispatcher,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Active
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.state
            .compare_exchange(from.raw(), to.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub async fn register(&self) {
        if self.transition(ChannelState::Unregistered, ChannelState::Registered) {
            debug!("channel {:?}: registered", self.peer_addr);
            self.dispatcher.on_registered(self.peer_addr).await;
        }
    }

    pub async fn activate(&self) {
        if self.transition(ChannelState::Registered, ChannelState::Active) {
            debug!("channel {:?}: active", self.peer_addr);
            self.dispatcher.on_active(self.peer_addr).await;
        }
    }

    pub async fn deactivate(&self) {
        if self.transition(ChannelState::Active, ChannelState::Inactive) {
            debug!("channel {:?}: inactive", self.peer_addr);
            self.dispatcher.on_inactive(self.peer_addr).await;
        }
    }

    pub async fn unregister(&self) {
        if self.transition(ChannelState::Inactive, ChannelState::Unregistered) {
            debug!("channel {:?}: unregistered", self.peer_addr);
            self.dispatcher.on_unregistered(self.peer_addr).await;
        }
    }

    /// the regular shutdown sequence: inactive, then unregistered - idempotent
    pub async fn shut_down(&self) {
        self.deactivate().await;
        self.unregister().await;
    }
}
