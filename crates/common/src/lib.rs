//! Types shared between the fleet hub and the nodes that connect to it.
//!
//! Keep the tunnel wire protocol and HTTP DTOs here so both sides agree on
//! one definition.

#![warn(missing_docs)]

/// HTTP API DTOs.
pub mod api;
/// Tunnel frames and their length-prefixed codec.
pub mod protocol;
