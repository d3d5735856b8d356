use crate::var_len;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

/// The decoder's parse position. Transitions happen only when the corresponding read was
///  fully satisfied from buffered bytes - a consumed byte is a committed byte, and a step
///  that cannot be satisfied leaves the previous state (and the buffer) untouched so the
///  same step is retried when more bytes arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// at a frame boundary, waiting for the flag / length marker byte
    AwaitingFlag,
    /// flag consumed, waiting for the trailing length bytes its marker form announces
    AwaitingLength { flag: u8 },
    /// length consumed, waiting for the full payload
    AwaitingBody { length: u64 },
}

/// Codec for length-delimited frames: a var-length encoded payload length followed by that
///  many opaque payload bytes.
///
/// A flag byte of 0 at a frame boundary is a skip marker (heartbeat / padding): it is
///  consumed silently, one byte at a time, without emitting a frame. This is distinct from
///  a *parsed length* of 0, which is only reachable through the `0xFD`/`0xFE`/`0xFF`
///  marker forms and emits an empty frame.
///
/// The decoder is resumable: [`Decoder::decode`] returning `Ok(None)` means "not enough
///  data, call again with more", and all progress through already-consumed bytes is
///  retained in the codec instance. One instance belongs to exactly one connection's read
///  loop and must never be shared across connections.
pub struct FrameCodec {
    state: DecodeState,
    max_frame_len: Option<u64>,
}

impl FrameCodec {
    pub fn new(max_frame_len: Option<u64>) -> FrameCodec {
        FrameCodec {
            state: DecodeState::AwaitingFlag,
            max_frame_len,
        }
    }

    /// The on-wire size of a frame holding `payload_len` payload bytes.
    pub fn encoded_len(payload_len: usize) -> usize {
        if payload_len == 0 {
            3
        }
        else {
            var_len::serialized_len(payload_len as u64) + payload_len
        }
    }

    /// Encode a frame into an arbitrary buffer - this is what the channels' write paths
    ///  use to fill pooled buffers.
    ///
    /// NB: a zero-length payload must not be framed with the canonical single length byte
    ///  0x00 - that byte is the skip marker and the frame would vanish on decode. Empty
    ///  frames use the two-byte marker form for their length instead.
    pub fn encode_into(payload: &[u8], buf: &mut impl BufMut) {
        if payload.is_empty() {
            buf.put_u8(var_len::MARKER_U16);
            buf.put_u16(0);
            return;
        }
        var_len::ser(payload.len() as u64, buf);
        buf.put_slice(payload);
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> anyhow::Result<Option<Bytes>> {
        loop {
            match self.state {
                DecodeState::AwaitingFlag => {
                    if !src.has_remaining() {
                        return Ok(None);
                    }
                    let flag = src.get_u8();
                    if flag == 0 {
                        trace!("skip byte at frame boundary");
                        continue;
                    }
                    self.state = DecodeState::AwaitingLength { flag };
                }
                DecodeState::AwaitingLength { flag } => {
                    if src.remaining() < var_len::trailing_len(flag) {
                        return Ok(None);
                    }
                    let length = var_len::deser_after_marker(flag, src)?;
                    if let Some(max_frame_len) = self.max_frame_len {
                        if length > max_frame_len {
                            anyhow::bail!("announced frame length {} exceeds the configured maximum of {}", length, max_frame_len);
                        }
                    }
                    self.state = DecodeState::AwaitingBody { length };
                }
                DecodeState::AwaitingBody { length } => {
                    if (src.remaining() as u64) < length {
                        return Ok(None);
                    }
                    let payload = src.split_to(length as usize).freeze();
                    self.state = DecodeState::AwaitingFlag;
                    return Ok(Some(payload));
                }
            }
        }
    }

    /// On connection close, any partially received frame is discarded - never emitted
    ///  truncated, never an error.
    fn decode_eof(&mut self, src: &mut BytesMut) -> anyhow::Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if self.state != DecodeState::AwaitingFlag || !src.is_empty() {
                    debug!("connection closed mid-frame: discarding partial frame state");
                    src.clear();
                    self.state = DecodeState::AwaitingFlag;
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> anyhow::Result<()> {
        dst.reserve(Self::encoded_len(payload.len()));
        Self::encode_into(&payload, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn encoded_frame(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new(None).encode(Bytes::copy_from_slice(payload), &mut buf).unwrap();
        buf
    }

    /// drain the codec, asserting that decoding never fails
    fn drain(codec: &mut FrameCodec, src: &mut BytesMut) -> Vec<Bytes> {
        let mut result = Vec::new();
        while let Some(frame) = codec.decode(src).unwrap() {
            result.push(frame);
        }
        result
    }

    #[test]
    fn test_encode_exact_bytes() {
        assert_eq!(encoded_frame(b"hello").as_ref(), b"\x05hello");
        // empty payloads take the marker form - a bare 0x00 would be a skip byte
        assert_eq!(encoded_frame(b"").as_ref(), &[0xFD, 0x00, 0x00][..]);
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::max_direct(252)]
    #[case::min_u16_marker(253)]
    #[case::min_u32_marker(65536)]
    #[case::megabyte(1 << 20)]
    fn test_frame_round_trip(#[case] payload_len: usize) {
        let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
        let mut src = encoded_frame(&payload);
        assert_eq!(src.len(), FrameCodec::encoded_len(payload_len));

        let mut codec = FrameCodec::new(None);
        let frames = drain(&mut codec, &mut src);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), payload.as_slice());
        assert!(src.is_empty());
    }

    /// NB: an *encoded length* of zero (reachable only through the marker forms, here
    ///  `FD 00 00`) emits an empty frame - unlike the flag==0 skip marker, which emits
    ///  nothing. The asymmetry is part of the wire format.
    #[test]
    fn test_zero_length_via_marker_emits_empty_frame() {
        let mut src = BytesMut::from(&[0xFD, 0x00, 0x00][..]);
        let mut codec = FrameCodec::new(None);

        let frames = drain(&mut codec, &mut src);

        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
    }

    #[test]
    fn test_skip_bytes_emit_nothing() {
        let mut src = BytesMut::from(&[0u8, 0, 0][..]);
        let mut codec = FrameCodec::new(None);

        assert!(drain(&mut codec, &mut src).is_empty());
        assert!(src.is_empty());
    }

    #[test]
    fn test_skip_bytes_before_frame() {
        let mut src = BytesMut::from(&[0u8, 0][..]);
        src.extend_from_slice(&encoded_frame(b"hello"));

        let mut codec = FrameCodec::new(None);
        let frames = drain(&mut codec, &mut src);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), b"hello");
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut src = encoded_frame(b"one");
        src.extend_from_slice(&encoded_frame(b""));
        src.extend_from_slice(&encoded_frame(b"three"));

        let mut codec = FrameCodec::new(None);
        let frames = drain(&mut codec, &mut src);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].as_ref(), b"one");
        assert_eq!(frames[1].as_ref(), b"");
        assert_eq!(frames[2].as_ref(), b"three");
    }

    /// feeding a frame's bytes split at every possible boundary must yield exactly the
    ///  same single frame, regardless of where the split falls
    #[rstest]
    #[case::direct_length(b"hello".to_vec())]
    #[case::empty_payload(b"".to_vec())]
    #[case::u16_marker_length((0..300).map(|i| (i % 256) as u8).collect())]
    fn test_partial_delivery_idempotence(#[case] payload: Vec<u8>) {
        let wire = encoded_frame(&payload);

        for split in 0..=wire.len() {
            let mut codec = FrameCodec::new(None);
            let mut src = BytesMut::new();

            src.extend_from_slice(&wire[..split]);
            let mut frames = drain(&mut codec, &mut src);

            src.extend_from_slice(&wire[split..]);
            frames.extend(drain(&mut codec, &mut src));

            assert_eq!(frames.len(), 1, "split at {}", split);
            assert_eq!(frames[0].as_ref(), payload.as_slice(), "split at {}", split);
            assert!(src.is_empty());
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let wire = encoded_frame(b"hello");

        let mut codec = FrameCodec::new(None);
        let mut src = BytesMut::new();
        let mut frames = Vec::new();

        for &byte in wire.as_ref() {
            src.extend_from_slice(&[byte]);
            frames.extend(drain(&mut codec, &mut src));
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), b"hello");
    }

    /// a frame announcing 2^40 bytes with only 10 delivered parks the decoder; closing the
    ///  connection discards the partial frame without emitting anything
    #[test]
    fn test_oversized_announced_length_parks_then_closes_cleanly() {
        let mut src = BytesMut::new();
        src.extend_from_slice(&[0xFF]);
        src.extend_from_slice(&(1u64 << 40).to_be_bytes());
        src.extend_from_slice(&[0u8; 10]);

        let mut codec = FrameCodec::new(None);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert_eq!(codec.state, DecodeState::AwaitingBody { length: 1 << 40 });

        assert!(codec.decode_eof(&mut src).unwrap().is_none());
        assert!(src.is_empty());
        assert_eq!(codec.state, DecodeState::AwaitingFlag);
    }

    #[test]
    fn test_decode_eof_without_partial_frame() {
        let mut src = encoded_frame(b"hi");
        let mut codec = FrameCodec::new(None);

        assert_eq!(codec.decode_eof(&mut src).unwrap().unwrap().as_ref(), b"hi");
        assert!(codec.decode_eof(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_max_frame_len_enforced() {
        let mut codec = FrameCodec::new(Some(10));

        let mut src = encoded_frame(&[7u8; 10]);
        let frames = drain(&mut codec, &mut src);
        assert_eq!(frames.len(), 1);

        let mut src = encoded_frame(&[7u8; 11]);
        assert!(codec.decode(&mut src).is_err());
    }

    /// the length announcement alone must trip the cap - the payload bytes may never arrive
    #[test]
    fn test_max_frame_len_enforced_before_body() {
        let mut codec = FrameCodec::new(Some(1000));
        let mut src = BytesMut::from(&[0xFD, 0xFF, 0xFF][..]);

        assert!(codec.decode(&mut src).is_err());
    }

    #[test]
    fn test_flag_is_committed_across_calls() {
        let mut codec = FrameCodec::new(None);

        // marker byte arrives alone, its length bytes later
        let mut src = BytesMut::from(&[0xFD][..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(src.is_empty());

        src.extend_from_slice(&[0x00, 0x02, b'h', b'i']);
        let frames = drain(&mut codec, &mut src);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), b"hi");
    }
}
