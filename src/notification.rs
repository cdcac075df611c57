//! Canonical notification record.
//!
//! Every inbound payload shape (single, bulk, system announcement) is
//! normalized into [`Notification`] before it touches the cache, the
//! dispatcher or the host state. A notification is immutable once created
//! except for `read_at`, which only the cache's read operations set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category assigned to locally synthesized system announcements.
pub const SYSTEM_CATEGORY: &str = "system";

/// Globally unique notification identifier.
///
/// Source-assigned for pushed notifications, locally synthesized for
/// system announcements.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub String);

impl NotificationId {
    /// Generate a fresh local identifier (`local-<uuid>`).
    #[must_use]
    pub fn local() -> Self {
        Self(format!("local-{}", uuid::Uuid::new_v4()))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NotificationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NotificationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for NotificationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Notification urgency.
///
/// Governs toast duration, sound selection and whether the system
/// notification requires manual dismissal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Informational.
    Low,
    /// Default urgency.
    #[default]
    Medium,
    /// Needs attention soon.
    High,
    /// Needs attention now; never auto-dismissed.
    Critical,
}

impl Priority {
    /// Returns the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse a wire priority. Unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "normal" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" | "urgent" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical notification record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Unique identifier; the idempotency key everywhere downstream.
    pub id: NotificationId,
    /// Originating business event tag (e.g. `order-status`, `message`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Coarse grouping used for preference routing.
    pub category: String,
    /// Urgency.
    pub priority: Priority,
    /// Display title.
    pub title: String,
    /// Display body.
    pub message: String,
    /// Optional deep-link target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
    /// Source-of-truth timestamp for ordering.
    pub created_at: DateTime<Utc>,
    /// When the notification was read; `None` means unread.
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Whether the notification has not been read yet.
    #[must_use]
    pub fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }

    /// Whether this record was synthesized from a system announcement.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.category == SYSTEM_CATEGORY
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_parse_is_lenient_about_case() {
        assert_eq!(Priority::parse("CRITICAL"), Some(Priority::Critical));
        assert_eq!(Priority::parse(" high "), Some(Priority::High));
        assert_eq!(Priority::parse("bogus"), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_local_ids_are_unique() {
        assert_ne!(NotificationId::local(), NotificationId::local());
        assert!(NotificationId::local().as_str().starts_with("local-"));
    }

    #[test]
    fn test_notification_serializes_camel_case() {
        let mut n = fixtures::notification("n1", Priority::High, "order-status");
        n.action_url = Some("/orders/1".to_string());
        let json = serde_json::to_value(&n).unwrap();

        assert_eq!(json["id"], "n1");
        assert_eq!(json["type"], "order-status");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["actionUrl"], "/orders/1");
        assert!(json["readAt"].is_null());
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn test_is_unread_tracks_read_at() {
        let mut n = fixtures::notification("n1", Priority::Low, "message");
        assert!(n.is_unread());
        n.read_at = Some(Utc::now());
        assert!(!n.is_unread());
    }
}
