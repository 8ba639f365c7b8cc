//! IPC bridge between launcher and test host: frame codec, message
//! registry, wire protocol types and pipe transport.

pub mod codec;
pub mod protocol;
pub mod registry;
pub mod transport;
