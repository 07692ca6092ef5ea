pub mod http;
pub mod memory;
pub mod rpc;
pub mod transport;
