//! Channel transport: framed duplex byte channels between processes.

pub mod channel;
pub mod codec;
pub mod listener;

pub use channel::{Channel, ChannelLimits};
pub use codec::FrameCodec;
pub use listener::{connect_local, send_hello, ChannelListener};
