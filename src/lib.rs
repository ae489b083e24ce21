//! Lantern Core Library
//!
//! Networking and identity core for Lantern, a client for a
//! relay-based social protocol. Two pieces live here: the relay
//! connection manager ([`relay`]) that maintains the client's
//! steady-state connection pool, and the remote-signer pairing session
//! ([`connect`]) that establishes the relationship with a separate
//! signing device.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

pub mod connect;
pub mod relay;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
