//! The protocol-interception side: trust evaluation that consumes the anchor
//! store, and the connections built on it.

mod runtime;
mod server;
mod tunnel;
mod verifier;

pub use runtime::intercept_runtime;
pub use server::{GREETING, LoopbackServer};
pub use tunnel::{TunnelError, UpstreamConnector};
pub use verifier::AnchorVerifier;
