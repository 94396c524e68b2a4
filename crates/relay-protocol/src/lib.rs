//! # relay-protocol
//!
//! Wire protocol definitions for the Relay gateway.
//!
//! This crate defines the envelope exchanged between clients and the gateway,
//! the close codes the gateway uses, and the per-connection frame codec.
//!
//! ## Envelope
//!
//! Every message is `{t, s, d, i}`: an uppercase event tag, an optional
//! correlation value, a payload, and an optional note.
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{Encoding, Envelope, FrameCodec};
//!
//! let mut codec = FrameCodec::new(Encoding::Zlib);
//! let frame = codec.encode(&Envelope::hello("01J0000000")).unwrap();
//! assert!(!frame.is_empty());
//! ```

pub mod close;
pub mod codec;
pub mod envelope;

pub use close::{Close, CloseCode};
pub use codec::{EncodedFrame, Encoding, FrameCodec, ProtocolError};
pub use envelope::{
    events, DispatchPayload, DispatchToPayload, Envelope, GuildDispatchPayload,
    NotificationPayload, Opcode,
};
