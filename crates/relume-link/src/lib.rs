//! `relume-link` – Host ↔ Controller Link
//!
//! - [`frame`] – start byte, length and checksum framing around postcard
//!   payloads, plus the streaming [`FrameParser`][frame::FrameParser].
//! - [`link`] – [`Link::spawn`][link::Link::spawn] over any async byte
//!   stream, and TCP [`connect`][link::connect] / [`listen`][link::listen]
//!   helpers.

pub mod frame;
pub mod link;

pub use frame::{FrameParser, decode_payload, encode_frame};
pub use link::{Link, LinkRx, LinkStats, LinkTx, accept, connect, listen};
