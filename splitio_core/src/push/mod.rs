//! Streaming (server-sent events) support: the SSE framing parser,
//! notification payloads, and the connection manager.
pub mod manager;
pub mod notifications;
pub mod sse;

pub use manager::{PushManager, PushMessage, KEEPALIVE_TIMEOUT, TOKEN_REFRESH_MARGIN};
pub use notifications::{ControlType, IncomingMessage, Notification, StreamingError};
pub use sse::{SseEvent, SseParser};
