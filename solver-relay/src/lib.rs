//! Wire types and the persistent websocket client for the intents relay.
//!
//! The relay is the message broker sitting between takers and solvers: it
//! fans quote requests and fill notifications out to every connected solver
//! and accepts signed quote responses back. This crate contains everything
//! needed to speak its JSON-RPC protocol; the pricing and signing logic lives
//! in the `solver-node` crate.
pub mod dto;
pub mod relay;

pub use relay::{RelayClient, RelayError, WsRelayClient};
