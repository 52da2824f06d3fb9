//! Host-side glue: helper lifecycle, frame routing and per-source transport choice

pub mod mailbox;
pub mod manager;
pub mod source;

pub use mailbox::FrameMailbox;
pub use manager::{BridgeManager, CommandLauncher, HelperLauncher, HelperProcess};
pub use source::{BrowserSource, SourceStats, TextureSink, Transport};
