//! Signal handlers
//!
//! Each handler translates one family of syscall events into tracker
//! updates. They are registered with the [`crate::dispatch::SignalRegistry`]
//! at startup; the self-check handler removes itself after its one-shot
//! verification.

pub mod endpoint;
pub mod network;
pub mod self_check;

pub use endpoint::EndpointSignalHandler;
pub use network::NetworkSignalHandler;
pub use self_check::SelfCheckNetworkHandler;
