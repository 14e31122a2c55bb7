use bytes::Bytes;
use tl_proto::{TlError, TlPacket, TlRead, TlResult};

/// Fixed-size byte array written as is, without a length prefix.
pub struct RawArray<const N: usize>;

impl<const N: usize> RawArray<N> {
    pub const SIZE_HINT: usize = N;

    #[inline]
    pub const fn size_hint(_: &[u8; N]) -> usize {
        N
    }

    #[inline]
    pub fn write<P: TlPacket>(value: &[u8; N], packet: &mut P) {
        packet.write_raw_slice(value);
    }

    pub fn read(packet: &mut &[u8]) -> TlResult<[u8; N]> {
        let Some((value, rest)) = packet.split_first_chunk::<N>() else {
            return Err(TlError::UnexpectedEof);
        };
        *packet = rest;
        Ok(*value)
    }
}

/// Length-prefixed bytes with an explicit size limit.
///
/// Unlike the default TL bytes encoding the length is always a full `u32`,
/// so payloads of any size up to `MAX_SIZE` share one layout.
pub struct BigBytes<const MAX_SIZE: usize>;

impl<const MAX_SIZE: usize> BigBytes<MAX_SIZE> {
    pub const MAX_SIZE: usize = MAX_SIZE;

    pub const fn size_hint(bytes: &Bytes) -> usize {
        let len = bytes.len();
        4 + len + Self::compute_padding(len)
    }

    pub fn write<P: TlPacket>(bytes: &Bytes, packet: &mut P) {
        const PADDING: [u8; 3] = [0; 3];

        let len = bytes.len();
        packet.write_u32(len as u32);
        packet.write_raw_slice(bytes);
        if len % 4 != 0 {
            packet.write_raw_slice(&PADDING[0..4 - len % 4]);
        }
    }

    pub fn read(packet: &mut &[u8]) -> TlResult<Bytes> {
        let len = u32::read_from(packet)? as usize;
        if len > Self::MAX_SIZE {
            return Err(TlError::InvalidData);
        }
        let padding = Self::compute_padding(len);

        if len + padding > packet.len() {
            return Err(TlError::UnexpectedEof);
        }

        let (data, rest) = packet.split_at(len);
        if rest[..padding].iter().any(|&b| b != 0) {
            return Err(TlError::InvalidData);
        }

        let bytes = Bytes::copy_from_slice(data);
        *packet = &rest[padding..];
        Ok(bytes)
    }

    const fn compute_padding(len: usize) -> usize {
        (4 - len % 4) % 4
    }
}
