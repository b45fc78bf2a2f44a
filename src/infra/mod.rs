pub mod collector;
pub mod rpc;
pub mod store;
pub mod sync;
