//! A server-side UDP transport for virtual-world clients: a single socket carries one 'circuit'
//!  per client, with optional per-packet reliability, duplicate suppression, ACK piggybacking,
//!  RTT estimation and hierarchical bandwidth throttling per traffic category.
//!
//! ## Design goals
//!
//! * Many clients over a single listening UDP socket, demultiplexed by remote address
//! * The abstraction is sending / receiving *messages*, each identified by a message id
//!   * messages bigger than a datagram are split at the transport level, except for the few
//!     messages the client cannot reassemble
//!   * optional zero-coding (run-length encoding of zero bytes) where it makes the datagram shorter
//! * Reliability is per packet and optional: reliable packets are resent with the `RESENT` flag
//!   until they are acknowledged, and the receiving side suppresses duplicates
//!   * There is no ordering guarantee and no reassembly of split messages on the receiving side
//! * Outbound traffic is shaped per connection and per category (land, wind, textures, ...) by a
//!   tree of token buckets: server - connection - category. Clients negotiate their category
//!   rates, and the server scales requests down to what it is willing to send.
//! * Connections are set up by an explicit, authorized handshake and torn down on request, on
//!   timeout or when the client reconnects from a different address
//!
//! ## Datagram structure
//!
//! ```ascii
//!  0: flags (u8): RELIABLE (0x01), RESENT (0x02), ZEROCODED (0x04), APPENDED_ACKS (0x08)
//!  1: sequence number (u32 BE) - 0 for unsequenced control traffic
//!  5: number of extra header bytes (u8)
//!  6: extra header bytes (ignored)
//!   : message id (1, 2 or 4 bytes) and payload, zero-coded if ZEROCODED is set
//!   : appended ACKs (u32 BE each), only if APPENDED_ACKS is set
//! -1: number of appended ACKs (u8), only if APPENDED_ACKS is set
//! ```
//!
//! Message ids come in three encodings:
//!
//! ```ascii
//! high frequency:   id (u8, 0..=254)
//! medium frequency: 0xFF, id (u8, 0..=254)
//! low frequency:    0xFF, 0xFF, id (u16 BE)
//! ```
//!
//! ## Architecture
//!
//! The [engine::TransportEngine] owns the socket and runs a receive loop, a decode loop and an
//!  outbound loop. Per-client state lives in [connection::Connection]. The application plugs in
//!  through a [message_dispatcher::MessageDispatcher] for inbound messages, a
//!  [session_authorizer::SessionAuthorizer] for circuit setup and a
//!  [queue_empty::QueueEmptyHandler] for refilling outbound queues, and it receives lifecycle
//!  events through a channel.

pub mod category;
pub mod config;
pub mod connection;
pub mod engine;
pub mod events;
pub mod job_engine;
pub mod message_dispatcher;
pub mod outgoing_packet;
pub mod queue_empty;
pub mod rate_limiter;
pub mod reliability;
pub mod session_authorizer;
pub mod socket;
pub mod stats;
pub mod test_util;
pub mod throttles;
pub mod util;
pub mod wire;
