//! Named defaults for the notification engine.
//!
//! Constants are grouped by component. Everything tunable at runtime is
//! mirrored by a `Config` field; these are the values used when the field
//! is absent.

use std::time::Duration;

// ============================================================================
// Connection
// ============================================================================

/// Delay before the first automatic reconnect attempt.
///
/// Subsequent delays double: `base * 2^(attempt - 1)`.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound for any single reconnect delay.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Consecutive failures after which the connection gives up (`failed`).
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// How long to wait for the source's `welcome` frame after the socket opens.
pub const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

/// Channel name used for the notification subscription.
pub const NOTIFICATIONS_CHANNEL: &str = "NotificationsChannel";

/// Room joined when the credential carries no role.
pub const DEFAULT_ROLE: &str = "user";

// ============================================================================
// Cache
// ============================================================================

/// Maximum number of notifications kept in local history.
pub const CACHE_CAPACITY: usize = 100;

/// Cache file name inside the config directory.
pub const CACHE_FILE_NAME: &str = "cache.json";

// ============================================================================
// Presentation
// ============================================================================

/// Delay after which non-critical system notifications are dismissed.
pub const SYSTEM_NOTIFICATION_DISMISS: Duration = Duration::from_secs(5);

/// Toast auto-close for `high` priority.
pub const TOAST_HIGH: Duration = Duration::from_secs(10);

/// Toast auto-close for `medium` priority.
pub const TOAST_MEDIUM: Duration = Duration::from_secs(7);

/// Toast auto-close for everything else below `medium`.
pub const TOAST_DEFAULT: Duration = Duration::from_secs(5);

// ============================================================================
// Engine
// ============================================================================

/// Capacity of the engine's event broadcast channel.
///
/// Slow subscribers past this many events observe `Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// REST
// ============================================================================

/// HTTP client request timeout for API calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default page size for history queries.
pub const HISTORY_PAGE_SIZE: u32 = 20;
