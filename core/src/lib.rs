pub mod proposer_vm;
pub mod storage;
pub mod syncer;
pub mod validators;
