//! `str0m`-backed collaborators
//!
//! [`Str0mFactory`] creates one [`Rtc`](str0m::Rtc) per session and drives it
//! on its own task over a UDP socket. [`SyntheticMedia`] stands in for a
//! capture device.

mod driver;
mod engine;
mod media;

pub use engine::{Str0mEngine, Str0mFactory};
pub use media::SyntheticMedia;
