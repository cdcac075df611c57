//! Per-category, per-channel delivery preferences.
//!
//! The authoritative copy lives on the server (see [`crate::api`]). The
//! engine keeps the last fetched snapshot in a [`PreferenceStore`] that the
//! dispatcher reads on every fan-out.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Delivery channel a user can toggle per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    /// In-application history and toasts.
    InApp,
    /// System (desktop/browser) notification.
    Push,
    /// Email.
    Email,
    /// Text message.
    Sms,
}

impl DeliveryChannel {
    /// Returns the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InApp => "in_app",
            Self::Push => "push",
            Self::Email => "email",
            Self::Sms => "sms",
        }
    }
}

impl std::str::FromStr for DeliveryChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_app" | "in-app" | "inapp" => Ok(Self::InApp),
            "push" | "system" => Ok(Self::Push),
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            other => Err(format!("unknown delivery channel '{other}'")),
        }
    }
}

impl std::fmt::Display for DeliveryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// Channel toggles for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelToggles {
    /// In-app delivery.
    #[serde(default = "default_true")]
    pub in_app: bool,
    /// System notification.
    #[serde(default = "default_true")]
    pub push: bool,
    /// Email.
    #[serde(default)]
    pub email: bool,
    /// Text message.
    #[serde(default)]
    pub sms: bool,
}

impl Default for ChannelToggles {
    fn default() -> Self {
        Self {
            in_app: true,
            push: true,
            email: false,
            sms: false,
        }
    }
}

impl ChannelToggles {
    /// Whether `channel` is enabled.
    pub fn get(&self, channel: DeliveryChannel) -> bool {
        match channel {
            DeliveryChannel::InApp => self.in_app,
            DeliveryChannel::Push => self.push,
            DeliveryChannel::Email => self.email,
            DeliveryChannel::Sms => self.sms,
        }
    }

    fn apply(&mut self, patch: &ChannelTogglesPatch) {
        if let Some(v) = patch.in_app {
            self.in_app = v;
        }
        if let Some(v) = patch.push {
            self.push = v;
        }
        if let Some(v) = patch.email {
            self.email = v;
        }
        if let Some(v) = patch.sms {
            self.sms = v;
        }
    }
}

/// A user's delivery preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    /// Master switch for audio cues.
    #[serde(default = "default_true")]
    pub sound_enabled: bool,
    /// Per-category toggles. Categories without an entry use the defaults.
    #[serde(default)]
    pub categories: BTreeMap<String, ChannelToggles>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            sound_enabled: true,
            categories: BTreeMap::new(),
        }
    }
}

impl Preferences {
    /// Whether notifications in `category` may be delivered over `channel`.
    pub fn allows(&self, category: &str, channel: DeliveryChannel) -> bool {
        self.categories
            .get(category)
            .map_or_else(|| ChannelToggles::default().get(channel), |t| t.get(channel))
    }

    /// Merge a partial update, the same way the server does.
    pub fn apply(&mut self, patch: &PreferencesPatch) {
        if let Some(sound) = patch.sound_enabled {
            self.sound_enabled = sound;
        }
        for (category, toggles) in &patch.categories {
            self.categories
                .entry(category.clone())
                .or_default()
                .apply(toggles);
        }
    }
}

/// Partial channel toggles; `None` leaves the server value unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelTogglesPatch {
    /// In-app delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_app: Option<bool>,
    /// System notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<bool>,
    /// Email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<bool>,
    /// Text message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sms: Option<bool>,
}

impl ChannelTogglesPatch {
    /// Patch setting a single channel.
    pub fn set(channel: DeliveryChannel, enabled: bool) -> Self {
        let mut patch = Self::default();
        match channel {
            DeliveryChannel::InApp => patch.in_app = Some(enabled),
            DeliveryChannel::Push => patch.push = Some(enabled),
            DeliveryChannel::Email => patch.email = Some(enabled),
            DeliveryChannel::Sms => patch.sms = Some(enabled),
        }
        patch
    }
}

/// Partial preference update, merged server-side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesPatch {
    /// New sound switch, if changing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound_enabled: Option<bool>,
    /// Per-category partial toggles.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub categories: BTreeMap<String, ChannelTogglesPatch>,
}

impl PreferencesPatch {
    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.sound_enabled.is_none() && self.categories.is_empty()
    }
}

/// Shared snapshot of the current preferences.
#[derive(Debug, Clone, Default)]
pub struct PreferenceStore {
    inner: Arc<RwLock<Preferences>>,
}

impl PreferenceStore {
    /// Create a store seeded with `preferences`.
    pub fn new(preferences: Preferences) -> Self {
        Self {
            inner: Arc::new(RwLock::new(preferences)),
        }
    }

    /// Copy of the current preferences.
    pub fn snapshot(&self) -> Preferences {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the snapshot (after a fetch or a successful update).
    pub fn replace(&self, preferences: Preferences) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = preferences;
    }

    /// Whether audio cues are enabled.
    pub fn sound_enabled(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sound_enabled
    }

    /// Whether `category` may use `channel`.
    pub fn allows(&self, category: &str, channel: DeliveryChannel) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .allows(category, channel)
    }
}
