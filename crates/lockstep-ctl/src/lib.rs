//! Controller side of a lockstep session.
//!
//! - [`client`] — blocking client for the control channel
//! - [`movie`] — input sequences stored as JSON

pub mod client;
pub mod movie;

pub use client::{ClientError, ControllerClient, FrameAck, Hello};
pub use movie::{Movie, MovieError};
