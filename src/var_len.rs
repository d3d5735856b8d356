use bytes::{Buf, BufMut};

/// Marker byte introducing a two-byte (u16 BE) length.
pub const MARKER_U16: u8 = 0xFD;
/// Marker byte introducing a four-byte (u32 BE) length.
pub const MARKER_U32: u8 = 0xFE;
/// Marker byte introducing an eight-byte (u64 BE) length.
pub const MARKER_U64: u8 = 0xFF;

/// The largest value that is encoded directly in the marker byte itself.
pub const MAX_DIRECT: u64 = 252;

/// Serialize a value in the canonical var-length encoding: values up to 252 are a single
///  byte, larger values are a marker byte followed by the shortest of u16 / u32 / u64 in
///  network byte order that holds the value.
pub fn ser(value: u64, buf: &mut impl BufMut) {
    if value <= MAX_DIRECT {
        buf.put_u8(value as u8);
    }
    else if value <= u16::MAX as u64 {
        buf.put_u8(MARKER_U16);
        buf.put_u16(value as u16);
    }
    else if value <= u32::MAX as u64 {
        buf.put_u8(MARKER_U32);
        buf.put_u32(value as u32);
    }
    else {
        buf.put_u8(MARKER_U64);
        buf.put_u64(value);
    }
}

/// The number of bytes [`ser`] produces for a given value: 1, 3, 5 or 9.
pub fn serialized_len(value: u64) -> usize {
    if value <= MAX_DIRECT {
        1
    }
    else if value <= u16::MAX as u64 {
        3
    }
    else if value <= u32::MAX as u64 {
        5
    }
    else {
        9
    }
}

/// The number of bytes that follow a given marker byte: 0 for a direct value, 2 / 4 / 8
///  for the marker forms. The marker byte alone fully determines this.
pub fn trailing_len(marker: u8) -> usize {
    match marker {
        MARKER_U16 => 2,
        MARKER_U32 => 4,
        MARKER_U64 => 8,
        _ => 0,
    }
}

/// Deserialize a value whose marker byte was already consumed, reading exactly
///  [`trailing_len`] further bytes from the buffer.
///
/// Callers must ensure that the trailing bytes are fully available before calling this -
///  a partial read fails without restoring the buffer position.
pub fn deser_after_marker(marker: u8, buf: &mut impl Buf) -> anyhow::Result<u64> {
    match marker {
        MARKER_U16 => Ok(buf.try_get_u16()? as u64),
        MARKER_U32 => Ok(buf.try_get_u32()? as u64),
        MARKER_U64 => Ok(buf.try_get_u64()?),
        direct => Ok(direct as u64),
    }
}

/// Deserialize a value including its marker byte.
pub fn deser(buf: &mut impl Buf) -> anyhow::Result<u64> {
    let marker = buf.try_get_u8()?;
    deser_after_marker(marker, buf)
}
