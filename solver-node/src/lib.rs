//! Market making solver for the intents relay.
//!
//! The node holds reserves of a two asset pair on the ledger and quotes
//! trades between them with a constant product price plus a configurable
//! margin. Quote requests arrive over the relay websocket, answers go back
//! signed under NEP-413 so the verifier contract can execute them without
//! further involvement from the solver.
//!
//! Module map:
//! - [`pricing`]: exact integer price math.
//! - [`reserves`]: the on-ledger balance snapshot quotes are priced against.
//! - [`cache`]: remembers published quote hashes until their deadline.
//! - [`intents`]: intent message encoding and NEP-413 hashing.
//! - [`ledger`]: JSON-RPC gateway for balance reads and signing.
//! - [`quoter`]: the orchestrator tying the above to the relay streams.
//! - [`http`]: liveness endpoint.
pub mod cache;
pub mod cli;
pub mod http;
pub mod intents;
pub mod ledger;
pub mod pricing;
pub mod quoter;
pub mod reserves;
