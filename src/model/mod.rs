//! Data models for signaling
//!
//! This module contains the wire frames exchanged with the relay and the
//! payload encodings that only the negotiating clients interpret.

pub mod description;
pub mod message;
