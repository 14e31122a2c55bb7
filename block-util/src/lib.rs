pub mod block;
pub mod ids;
pub mod summary;
