//! The live display layer: broadcast bus, stream managers and their shows,
//! ingress fan-in, and per-client fan-out.

pub mod bus;
pub mod client;
pub mod ingress;
pub mod message;
pub mod shows;
pub mod sources;
pub mod status;
pub mod stream;
