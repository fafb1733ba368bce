//! Per-client offer/answer negotiation
//!
//! A [`session::Session`] drives one peer connection through the offer/answer
//! exchange for a single channel. The [`manager::CallManager`] owns the
//! sessions of one relay connection and routes relay frames to them.

pub mod candidates;
pub mod engine;
pub mod error;
pub mod manager;
pub mod session;

#[cfg(test)]
pub mod mock;
