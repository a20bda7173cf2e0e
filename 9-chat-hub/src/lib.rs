//! WebSocket chat hub with multiplexed binary file uploads.
//!
//! Peers exchange JSON text frames tagged by `kind` (chat, uploads, document
//! requests) and raw binary frames carrying upload payloads. Each module
//! focuses on one responsibility:
//!
//! - [`registry`] tracks live peers and their bounded outbound queues.
//! - [`broadcast`] fans an event out to every peer, pruning dead ones.
//! - [`binding`] remembers which upload a connection's next binary frame
//!   belongs to.
//! - [`upload`] streams partial uploads into scratch files.
//! - [`pool`] runs delayed background jobs on a bounded set of workers.
//! - [`router`] decodes inbound frames and drives the stores above.
//! - [`hub`] wires everything together and owns the connection lifecycle.
//! - [`server`] serves the hub over WebSocket with axum.
//! - [`client`] is the interactive terminal front end.
//! - [`cli`] and [`config`] hold the command line and hub tunables.
//! - [`message`] defines the JSON envelope shared by server and client.
//!
//! Integration tests drive [`hub::Hub`] directly and through a real socket.

pub mod binding;
pub mod broadcast;
pub mod cli;
pub mod client;
pub mod config;
pub mod hub;
pub mod message;
pub mod pool;
pub mod registry;
pub mod router;
pub mod server;
pub mod upload;
