pub use self::proposer_block::{InnerBlockBytes, ProposerBlock, ProposerBlockHeader};

mod proposer_block;
