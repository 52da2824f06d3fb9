pub mod codec;
pub mod frame;

pub use frame::Frame;
pub use frame::FrameMetadata;
pub use frame::PixelFormat;
