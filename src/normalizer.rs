//! Inbound frame normalization.
//!
//! Pure transformation from the heterogeneous payloads pushed by the
//! notification source into canonical [`Notification`] records. No I/O.
//!
//! # Frame shapes
//!
//! ```text
//! {"type": "notification",        "data": { ...notification... }}
//! {"type": "bulk_notifications",  "data": [ {...}, {...} ]}
//! {"type": "system_announcement", "data": {"title": .., "message": .., "actionUrl"?: .., "type"?: ..}}
//! ```
//!
//! Unrecognized frame types normalize to an empty list. Individual
//! notification payloads missing a required field are dropped with a
//! warning; the rest of a bulk frame still goes through.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::notification::{Notification, NotificationId, Priority, SYSTEM_CATEGORY};

/// Frame discriminator for a single notification.
pub const FRAME_NOTIFICATION: &str = "notification";
/// Frame discriminator for a batch of notifications.
pub const FRAME_BULK: &str = "bulk_notifications";
/// Frame discriminator for a system-wide announcement.
pub const FRAME_ANNOUNCEMENT: &str = "system_announcement";

/// Notification type assigned to announcements that carry none.
const ANNOUNCEMENT_KIND: &str = "system-announcement";

/// Recognized inbound frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// One notification.
    Single,
    /// A batch of notifications, in order.
    Bulk,
    /// A system announcement to synthesize into a notification.
    Announcement,
}

impl FrameKind {
    /// Map a wire discriminator to a frame kind.
    pub fn from_discriminator(s: &str) -> Option<Self> {
        match s {
            FRAME_NOTIFICATION => Some(Self::Single),
            FRAME_BULK => Some(Self::Bulk),
            FRAME_ANNOUNCEMENT => Some(Self::Announcement),
            _ => None,
        }
    }
}

/// Wire shape of a single notification payload. Every field is optional
/// here so missing ones can be reported instead of failing the whole frame.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNotification {
    id: Option<Value>,
    #[serde(rename = "type")]
    kind: Option<String>,
    category: Option<String>,
    priority: Option<String>,
    title: Option<String>,
    message: Option<String>,
    action_url: Option<String>,
    created_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAnnouncement {
    title: String,
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    action_url: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

/// Normalize one raw frame into zero or more notifications, preserving
/// the order in which they appear in the frame.
pub fn normalize(frame: &Value) -> Vec<Notification> {
    let Some(discriminator) = frame.get("type").and_then(Value::as_str) else {
        log::debug!("[Normalizer] Dropping frame without type discriminator");
        return Vec::new();
    };

    let Some(kind) = FrameKind::from_discriminator(discriminator) else {
        log::debug!("[Normalizer] Dropping unrecognized frame type '{}'", discriminator);
        return Vec::new();
    };

    let data = frame.get("data").unwrap_or(&Value::Null);

    match kind {
        FrameKind::Single => normalize_payload(data).into_iter().collect(),
        FrameKind::Bulk => match data.as_array() {
            Some(items) => items.iter().filter_map(normalize_payload).collect(),
            None => {
                log::warn!("[Normalizer] Bulk frame without an array payload");
                Vec::new()
            }
        },
        FrameKind::Announcement => synthesize_announcement(data).into_iter().collect(),
    }
}

/// Normalize a bare notification payload (no frame envelope), as returned
/// by the history endpoint. Returns `None` if a required field is missing.
pub fn normalize_payload(payload: &Value) -> Option<Notification> {
    let raw: RawNotification = match serde_json::from_value(payload.clone()) {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("[Normalizer] Malformed notification payload: {}", e);
            return None;
        }
    };

    // Sources send ids as either strings or integers.
    let id = match raw.id {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => return reject("id"),
    };

    let Some(kind) = raw.kind else {
        return reject("type");
    };
    let Some(category) = raw.category else {
        return reject("category");
    };
    let Some(title) = raw.title else {
        return reject("title");
    };
    let Some(message) = raw.message else {
        return reject("message");
    };
    let Some(created_at) = raw.created_at else {
        return reject("createdAt");
    };

    let priority = match raw.priority.as_deref() {
        Some(p) => Priority::parse(p).unwrap_or_else(|| {
            log::debug!("[Normalizer] Unknown priority '{}' for {}, using medium", p, id);
            Priority::Medium
        }),
        None => return reject("priority"),
    };

    Some(Notification {
        id: NotificationId(id),
        kind,
        category,
        priority,
        title,
        message,
        action_url: raw.action_url.filter(|u| !u.is_empty()),
        created_at,
        read_at: raw.read_at,
    })
}

fn reject(field: &str) -> Option<Notification> {
    log::warn!("[Normalizer] Dropping notification without '{}'", field);
    None
}

fn synthesize_announcement(payload: &Value) -> Option<Notification> {
    let raw: RawAnnouncement = match serde_json::from_value(payload.clone()) {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("[Normalizer] Malformed system announcement: {}", e);
            return None;
        }
    };

    Some(Notification {
        id: NotificationId::local(),
        kind: raw.kind.unwrap_or_else(|| ANNOUNCEMENT_KIND.to_string()),
        category: SYSTEM_CATEGORY.to_string(),
        priority: Priority::High,
        title: raw.title,
        message: raw.message,
        action_url: raw.action_url.filter(|u| !u.is_empty()),
        created_at: raw.created_at.unwrap_or_else(Utc::now),
        read_at: None,
    })
}
