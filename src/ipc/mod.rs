//! Newline-delimited JSON channel to the browser helper (fallback transport)

pub mod channel;
pub mod protocol;

pub use channel::{ChannelEvent, ChannelStats, FrameCallback, LineChannel};
pub use protocol::{encode_frame_message, Command, Inbound};
