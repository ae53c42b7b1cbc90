use crate::domain::slots::SlotTable;
use std::fmt;

/// Lifecycle of the link to the smart box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    /// Backoff reconnect in progress (1-based attempt counter)
    Reconnecting { attempt: u32 },
    /// Link lost or never established; carries the reason when there was one
    Disconnected { error: Option<String> },
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Idle => write!(f, "Idle"),
            LinkState::Scanning => write!(f, "Scanning for device..."),
            LinkState::Connecting => write!(f, "Connecting..."),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Reconnecting { attempt } => write!(f, "Reconnecting (attempt {})", attempt),
            LinkState::Disconnected { error: Some(e) } => write!(f, "Disconnected: {}", e),
            LinkState::Disconnected { error: None } => write!(f, "Disconnected"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    /// A notification decoded into a fresh slot table
    SlotTable(SlotTable),
    LinkState(LinkState),
    /// The peripheral dropped an established connection
    LinkLost { reason: String },
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
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
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connected_is_connected() {
        assert!(LinkState::Connected.is_connected());
        assert!(!LinkState::Reconnecting { attempt: 2 }.is_connected());
        assert!(!LinkState::Disconnected { error: None }.is_connected());
    }

    #[test]
    fn test_state_display() {
        let state = LinkState::Disconnected {
            error: Some("adapter off".to_string()),
        };
        assert_eq!(state.to_string(), "Disconnected: adapter off");
        assert_eq!(
            LinkState::Reconnecting { attempt: 3 }.to_string(),
            "Reconnecting (attempt 3)"
        );
    }
}
