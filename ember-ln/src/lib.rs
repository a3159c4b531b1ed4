//! The node core of a mobile-oriented Lightning wallet.
//!
//! This crate implements the protocol engine that maintains payment channels
//! with a single trusted trampoline peer and exchanges value on the
//! Lightning Network on behalf of a light-client user:
//!
//! - [`channel`]: the per-channel state machine, a pure transition function
//!   with no I/O.
//! - [`peer`]: the orchestrator which owns the channels, the transport
//!   connection, and the serial command queue.
//! - [`swap`]: promotion of confirmed on-chain UTXOs into channel liquidity.
//! - [`payments`]: incoming / outgoing payment handlers and the persistence
//!   contract.
//! - [`postman`]: onion-message delivery and subscriptions.
//!
//! External collaborators (chain client, noise cipher, sphinx crypto, key
//! derivation, database engine) stay behind the trait seams in [`electrum`],
//! [`transport`], [`sphinx`], [`keys`], and [`payments::db`].

/// Sealed (encrypted + authenticated) channel state backups.
pub mod backup;
/// The channel state machine.
pub mod channel;
/// Chain-source interface and feerates.
pub mod electrum;
/// Domain events and the event bus.
pub mod events;
/// Bolt 11 invoice facade.
pub mod invoice;
/// Key-manager seam.
pub mod keys;
/// Payment domain model, handlers, and storage contract.
pub mod payments;
/// The peer orchestrator.
pub mod peer;
/// Onion-message postman.
pub mod postman;
/// Onion-routing (sphinx) seams.
pub mod sphinx;
/// Swap-in manager.
pub mod swap;
/// Noise-framed transport.
pub mod transport;
/// On-chain wallet snapshot model.
pub mod wallet;
/// Lightning wire messages and codec.
pub mod wire;
