pub mod block;
pub mod block_changes;
pub mod cell;
pub mod cursor;
pub mod error;
pub mod selector;
pub mod signer;
pub mod tx_builder;
