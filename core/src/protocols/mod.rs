//! Protocol dissectors.
//!
//! `packet` holds the link/network/transport header views that populate a
//! [`FlowKey`](packet::FlowKey); `stream` holds the application-layer
//! dissectors that produce fingerprints and metadata.

pub mod packet;
pub mod stream;
