pub mod dialect;
pub mod sse;
pub mod usage;

pub use dialect::Dialect;
pub use sse::{encode_event, SseFrame, SseFrameScanner};
pub use usage::UsageTuple;
