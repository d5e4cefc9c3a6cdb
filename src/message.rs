// src/message.rs
use std::fmt;
use std::sync::Arc;

/// The only payload toil ever pushes to browsers.
pub const RELOAD: &[u8] = b"reload";

/// An opaque payload pushed to every connected browser tab.
///
/// Cloning is cheap: all connections receiving the same broadcast share one
/// allocation.
#[derive(Clone, PartialEq, Eq)]
pub struct Message(Arc<[u8]>);

impl Message {
    pub fn new(payload: impl Into<Arc<[u8]>>) -> Self {
        Message(payload.into())
    }

    /// The `reload` notification.
    pub fn reload() -> Self {
        Message::new(RELOAD)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::new(text.as_bytes())
    }
}
