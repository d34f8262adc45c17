// Thin re-export module: block structure, the mempool and the chain manager
// live in their own files under `blockchain/`.

pub mod block;
pub mod chain;
pub mod mempool;

pub use block::*;
pub use chain::*;
pub use mempool::*;
