//! Wire types shared by the JSON-RPC engine, the signaling session
//! controller, and the reactive state-convergence fabric.
//!
//! Mirrors the teacher's `rt-protocol` crate: a tagged-enum wire format with
//! `serde`-derived types and no runtime logic.

pub mod entities;
pub mod jsonrpc;
pub mod signaling;

pub use entities::*;
pub use jsonrpc::*;
pub use signaling::*;
