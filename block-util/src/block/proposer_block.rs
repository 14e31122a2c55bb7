use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use glacier_util::tl::{BigBytes, RawArray};
use tl_proto::{TlError, TlPacket, TlRead, TlResult, TlWrite};
use tycho_crypto::ed25519;

use crate::ids::BlockId;

/// Inner block payload limit.
pub type InnerBlockBytes = BigBytes<{ 2 << 20 }>; // 2 MB

/// Signed part of the proposer block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposerBlockHeader {
    /// Id of the previous proposer block.
    pub parent: BlockId,
    /// Height of the block, same as the height of the wrapped inner block.
    pub height: u64,
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Height of the validator set used to select the proposer.
    pub validators_height: u64,
    /// Ed25519 public key of the proposer.
    pub proposer: [u8; 32],
    /// Serialized inner block.
    pub inner: Bytes,
}

impl ProposerBlockHeader {
    pub const TL_ID: u32 = 0x9e3c51a2;
}

impl TlWrite for ProposerBlockHeader {
    type Repr = tl_proto::Boxed;

    fn max_size_hint(&self) -> usize {
        4 + 32 + 8 + 8 + 8 + 32 + InnerBlockBytes::size_hint(&self.inner)
    }

    fn write_to<P>(&self, packet: &mut P)
    where
        P: TlPacket,
    {
        packet.write_u32(Self::TL_ID);
        RawArray::<32>::write(self.parent.as_array(), packet);
        packet.write_u64(self.height);
        packet.write_u64(self.timestamp_ms);
        packet.write_u64(self.validators_height);
        RawArray::<32>::write(&self.proposer, packet);
        InnerBlockBytes::write(&self.inner, packet);
    }
}

impl<'tl> TlRead<'tl> for ProposerBlockHeader {
    type Repr = tl_proto::Boxed;

    fn read_from(packet: &mut &'tl [u8]) -> TlResult<Self> {
        if u32::read_from(packet)? != Self::TL_ID {
            return Err(TlError::UnknownConstructor);
        }

        Ok(Self {
            parent: BlockId(RawArray::<32>::read(packet)?),
            height: u64::read_from(packet)?,
            timestamp_ms: u64::read_from(packet)?,
            validators_height: u64::read_from(packet)?,
            proposer: RawArray::<32>::read(packet)?,
            inner: InnerBlockBytes::read(packet)?,
        })
    }
}

/// Deserialized and verified proposer block.
#[derive(Clone)]
#[repr(transparent)]
pub struct ProposerBlock {
    inner: Arc<Inner>,
}

impl ProposerBlock {
    pub const TL_ID: u32 = 0xd1f0b7c4;

    /// Signs the header and serializes the full block.
    pub fn build(header: ProposerBlockHeader, keypair: &ed25519::KeyPair) -> Self {
        let header = ProposerBlockHeader {
            proposer: keypair.public_key.to_bytes(),
            ..header
        };

        let signature = keypair.sign_raw(&tl_proto::serialize(&header));

        let mut data = Vec::with_capacity(4 + header.max_size_hint() + 64);
        data.extend_from_slice(&Self::TL_ID.to_le_bytes());
        header.write_to(&mut data);
        data.extend_from_slice(&signature);

        let data = Bytes::from(data);
        Self {
            inner: Arc::new(Inner {
                id: BlockId::compute(&data),
                header,
                signature,
                data,
            }),
        }
    }

    /// Parses the block and verifies the proposer signature.
    ///
    /// The whole input must be consumed.
    pub fn deserialize(data: Bytes) -> Result<Self> {
        let mut packet = data.as_ref();
        anyhow::ensure!(
            u32::read_from(&mut packet).context("proposer block is too short")? == Self::TL_ID,
            "unknown proposer block constructor"
        );

        let header_start = packet;
        let header =
            ProposerBlockHeader::read_from(&mut packet).context("invalid proposer block header")?;
        let header_bytes = &header_start[..header_start.len() - packet.len()];

        let signature =
            RawArray::<64>::read(&mut packet).context("invalid proposer block signature")?;
        anyhow::ensure!(
            packet.is_empty(),
            "unexpected {} trailing bytes after proposer block",
            packet.len()
        );

        let public_key = ed25519::PublicKey::from_bytes(header.proposer)
            .context("invalid proposer public key")?;
        anyhow::ensure!(
            public_key.verify_raw(header_bytes, &signature),
            "invalid proposer block signature"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                id: BlockId::compute(&data),
                header,
                signature,
                data,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> &BlockId {
        &self.inner.id
    }

    #[inline]
    pub fn height(&self) -> u64 {
        self.inner.header.height
    }

    #[inline]
    pub fn parent(&self) -> &BlockId {
        &self.inner.header.parent
    }

    #[inline]
    pub fn timestamp_ms(&self) -> u64 {
        self.inner.header.timestamp_ms
    }

    pub fn header(&self) -> &ProposerBlockHeader {
        &self.inner.header
    }

    pub fn signature(&self) -> &[u8; 64] {
        &self.inner.signature
    }

    /// Serialized block.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.inner.data
    }
}

impl std::fmt::Debug for ProposerBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProposerBlock")
            .field("id", self.id())
            .field("height", &self.height())
            .field("parent", self.parent())
            .finish()
    }
}

impl PartialEq for ProposerBlock {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ProposerBlock {}

struct Inner {
    id: BlockId,
    header: ProposerBlockHeader,
    signature: [u8; 64],
    data: Bytes,
}

#[cfg(any(test, feature = "test"))]
impl ProposerBlock {
    /// Builds a block at `height` signed with a key derived from `seed`.
    pub fn new_test(height: u64, seed: u8, inner: &'static [u8]) -> Self {
        let secret = ed25519::SecretKey::from_bytes([seed; 32]);
        let keypair = ed25519::KeyPair::from(&secret);

        Self::build(
            ProposerBlockHeader {
                parent: BlockId([seed.wrapping_add(1); 32]),
                height,
                timestamp_ms: 1_650_000_000_000 + height,
                validators_height: 100,
                proposer: [0; 32],
                inner: Bytes::from_static(inner),
            },
            &keypair,
        )
    }
}
