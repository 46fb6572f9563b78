use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle of the wireless link, owned by the transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringCapabilities,
    Ready,
    Disconnected,
    Failed(String),
}

impl LinkState {
    /// States in which a low-level link to the peripheral may be open.
    pub fn holds_link(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::DiscoveringCapabilities | Self::Ready
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringCapabilities => write!(f, "Discovering"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed(reason) => write!(f, "Failed ({})", reason),
        }
    }
}

/// A discovered peripheral, valid only until the connection attempt resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    /// Platform identifier (Bluetooth address on Windows).
    pub id: String,
    /// Advertised local name
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    Player,
    Bot,
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Player => write!(f, "Player"),
            Self::Bot => write!(f, "Bot"),
        }
    }
}

/// Outcome of one refereed duel.
///
/// Only the referee builds these; everything else reads them. Field names are
/// serialized in camelCase so stored documents keep the leaderboard schema
/// (`playerTimeSeconds`, `botTimeSeconds`, `winner`, `timestamp`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuelResult {
    player_time_seconds: f32,
    bot_time_seconds: f32,
    winner: Winner,
    /// Unix milliseconds at resolution
    #[serde(default)]
    timestamp: i64,
}

impl DuelResult {
    pub(crate) fn new(
        player_time_seconds: f32,
        bot_time_seconds: f32,
        winner: Winner,
        timestamp: i64,
    ) -> Self {
        Self {
            player_time_seconds,
            bot_time_seconds,
            winner,
            timestamp,
        }
    }

    pub fn player_time_seconds(&self) -> f32 {
        self.player_time_seconds
    }

    pub fn bot_time_seconds(&self) -> f32 {
        self.bot_time_seconds
    }

    pub fn winner(&self) -> Winner {
        self.winner
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// One row of the fastest-player-wins ranking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub player_time_seconds: f32,
}

/// Requests originating from the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    Connect,
    Disconnect,
    StartDuel,
    ShowLeaderboard,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(message, MessageSeverity::Info)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(message, MessageSeverity::Success)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(message, MessageSeverity::Warning)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message, MessageSeverity::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duel_result_uses_document_field_names() {
        let result = DuelResult::new(0.701, 1.2, Winner::Player, 1_700_000_000_000);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["winner"], "Player");
        assert!(json.get("playerTimeSeconds").is_some());
        assert!(json.get("botTimeSeconds").is_some());
        assert_eq!(json["timestamp"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_link_state_classification() {
        assert!(LinkState::Ready.holds_link());
        assert!(!LinkState::Scanning.holds_link());
    }
}
