//! gRPC protocol definitions for spyglass
//!
//! Defines:
//! - `CollectorService` - the bidirectional agent/collector channel
//! - `NetworkObservations` - per-tick connection and endpoint deltas
//! - `RuntimeFilteringConfiguration` - collector-pushed runtime config
//!
//! Generated from `proto/spyglass.proto`.

pub mod v1 {
    tonic::include_proto!("spyglass.v1");
}

pub use v1::collector_service_client::CollectorServiceClient;
pub use v1::collector_service_server::{CollectorService, CollectorServiceServer};
pub use v1::*;
