//! The rendezvous ("mailbox") server for Magic Wormhole: clients meet at a
//! short-named nameplate, exchange a handful of opaque messages through a
//! shared mailbox, and disconnect.

pub mod app;
pub mod database;
pub mod message;
pub mod rlimits;
pub mod server;
pub mod websocket;
