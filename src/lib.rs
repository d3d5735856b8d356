//! A transport-and-framing layer for building length-delimited message protocols on top
//!  of byte-oriented (TCP) and datagram-oriented (UDP) connections.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *frames* (defined-length chunks of opaque
//!   bytes) rather than raw byte streams - the framing below is all a protocol author
//!   needs to layer a message protocol over a socket
//! * Partial delivery is the normal case, not an error: the decoder is a resumable state
//!   machine that picks up exactly where the last byte left off, without re-parsing and
//!   without losing data, no matter where the transport splits the stream
//! * One task per connection and one per listening socket - no global event loop.
//!   Blocking I/O suspends only the task that issued it
//! * Servers derive child channels: TCP per accepted connection, UDP per distinct remote
//!   address observed on the shared socket (an application-level 'session')
//! * Per-channel single-writer discipline: a write lock keeps concurrently written frames
//!   contiguous on the wire. There is no flow control beyond that - backpressure,
//!   reconnects and routing belong to the layers above
//! * I/O buffers come from size-classed pools to keep the per-read allocation cost down
//!
//! ## Wire format
//!
//! A frame on the wire is a var-length encoded payload length followed by the payload
//!  (all multi-byte numbers in network byte order):
//!
//! ```ascii
//! 0:  flag byte:
//!     * 0x00        skip marker: consumed silently, no frame is emitted. Can be used
//!                    as a heartbeat or padding byte between frames
//!     * 0x01..0xFC  the payload length itself (1..252)
//!     * 0xFD        payload length follows as u16 BE (2 bytes)
//!     * 0xFE        payload length follows as u32 BE (4 bytes)
//!     * 0xFF        payload length follows as u64 BE (8 bytes)
//! *:  payload (exactly `length` bytes, opaque)
//! ```
//!
//! NB: A *parsed* length of zero is not the same as the 0x00 skip marker: it is only
//!  reachable through the 0xFD / 0xFE / 0xFF marker forms (e.g. `FD 00 00`) and emits an
//!  empty frame, whereas the skip marker emits nothing. Both sides of this asymmetry are
//!  load-bearing for wire compatibility.
//!
//! The length encoding is bijective on `[0, 2^64)` and the encoder picks the shortest
//!  form, with one exception: an empty frame is encoded as `FD 00 00`, since the
//!  canonical single byte `0x00` would read back as a skip marker. The decoder accepts
//!  whatever form the marker byte announces.
//!
//! ## Lifecycle
//!
//! Channels move through `Unregistered -> Registered -> Active -> Inactive ->
//!  Unregistered`, with events fired to the [`frame_dispatcher::FrameDispatcher`] sink in
//!  that order. Connection close is cooperative: closing the underlying socket makes the
//!  channel's blocked read return, and the read loop treats that as a shutdown trigger
//!  rather than an error to propagate.

pub mod buffers;
pub mod channel;
pub mod config;
pub mod frame_codec;
pub mod frame_dispatcher;
pub mod frame_queue;
pub mod tcp_channel;
pub mod udp_channel;
pub mod var_len;

#[cfg(test)]
pub mod test_util;
