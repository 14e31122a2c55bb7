use bytes::Bytes;
use glacier_util::tl::BigBytes;
use tl_proto::{TlError, TlRead, TlWrite};

use crate::ids::SummaryId;

pub type SummaryBlockBytes = BigBytes<{ 4 << 20 }>; // 4 MB
pub type InnerSummaryBytes = BigBytes<{ 1 << 20 }>; // 1 MB

#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("proposer block is too big: {0} bytes")]
    BlockTooBig(usize),
    #[error("inner summary is too big: {0} bytes")]
    InnerTooBig(usize),
    #[error("invalid stateless summary")]
    InvalidData(#[source] TlError),
    #[error("unexpected {0} trailing bytes after stateless summary")]
    TrailingBytes(usize),
}

/// State summary bound to the proposer block at the same height.
///
/// Layout:
/// ```text
/// proposer.stateSummary fork_height:long block:bytes inner:bytes
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatelessSummary {
    fork_height: u64,
    block: Bytes,
    inner: Bytes,
    id: SummaryId,
    data: Bytes,
}

impl StatelessSummary {
    pub const TL_ID: u32 = 0x5a7d2e93;

    pub fn build(fork_height: u64, block: Bytes, inner: Bytes) -> Result<Self, SummaryError> {
        if block.len() > SummaryBlockBytes::MAX_SIZE {
            return Err(SummaryError::BlockTooBig(block.len()));
        }
        if inner.len() > InnerSummaryBytes::MAX_SIZE {
            return Err(SummaryError::InnerTooBig(inner.len()));
        }

        let mut data = Vec::with_capacity(
            4 + 8 + SummaryBlockBytes::size_hint(&block) + InnerSummaryBytes::size_hint(&inner),
        );
        data.extend_from_slice(&Self::TL_ID.to_le_bytes());
        fork_height.write_to(&mut data);
        SummaryBlockBytes::write(&block, &mut data);
        InnerSummaryBytes::write(&inner, &mut data);

        let data = Bytes::from(data);
        Ok(Self {
            fork_height,
            block,
            inner,
            id: SummaryId::compute(&data),
            data,
        })
    }

    /// Strict decoding: exact constructor, bounded fields and no trailing bytes.
    pub fn parse(data: &[u8]) -> Result<Self, SummaryError> {
        let mut packet = data;

        let tl_id = u32::read_from(&mut packet).map_err(SummaryError::InvalidData)?;
        if tl_id != Self::TL_ID {
            return Err(SummaryError::InvalidData(TlError::UnknownConstructor));
        }

        let fork_height = u64::read_from(&mut packet).map_err(SummaryError::InvalidData)?;
        let block = SummaryBlockBytes::read(&mut packet).map_err(SummaryError::InvalidData)?;
        let inner = InnerSummaryBytes::read(&mut packet).map_err(SummaryError::InvalidData)?;
        if !packet.is_empty() {
            return Err(SummaryError::TrailingBytes(packet.len()));
        }

        Ok(Self {
            fork_height,
            block,
            inner,
            id: SummaryId::compute(data),
            data: Bytes::copy_from_slice(data),
        })
    }

    #[inline]
    pub fn fork_height(&self) -> u64 {
        self.fork_height
    }

    /// Serialized proposer block.
    #[inline]
    pub fn block(&self) -> &Bytes {
        &self.block
    }

    /// Serialized inner summary.
    #[inline]
    pub fn inner(&self) -> &Bytes {
        &self.inner
    }

    #[inline]
    pub fn id(&self) -> &SummaryId {
        &self.id
    }

    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}
