//! Link state graph.
//!
//! ```text
//! SEARCHING -> FOUND -> CONNECTING -> CONNECTED -> DISCONNECTED -> SEARCHING
//!     |          |                       ^
//!     +----------+--- inbound accept ----+
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Searching,
    Found,
    Connecting,
    Connected,
    Disconnected,
}

impl LinkState {
    pub fn can_advance_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Searching, Found)
                | (Searching, Connected)
                | (Found, Connecting)
                | (Found, Connected)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Searching)
        )
    }

    /// States in which a new beacon may be adopted as the peer.
    pub fn accepts_new_peer(self) -> bool {
        matches!(self, LinkState::Searching | LinkState::Found)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Searching => "SEARCHING",
            LinkState::Found => "FOUND",
            LinkState::Connecting => "CONNECTING",
            LinkState::Connected => "CONNECTED",
            LinkState::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
