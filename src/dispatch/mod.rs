//! Presentation dispatcher.
//!
//! Routes a canonical [`Notification`] to the installed sinks. Every
//! matching sink is invoked, in this order:
//!
//! 1. **System notification**: unless permission is denied or the user
//!    disabled `push` for the category. Critical notifications require
//!    interaction; everything else is dismissed after a fixed delay, whether
//!    or not the show call succeeded.
//! 2. **Sound**: unless sound is disabled. The key comes from
//!    [`SoundKey::for_notification`].
//! 3. **Toast**: always. Auto-close duration follows the priority.
//!
//! Sinks are isolated from each other. A failing or panicking sink is
//! logged and recorded in the [`DispatchReport`]; it never stops the
//! remaining sinks and never reaches the caller.
//!
//! Sinks are capability traits so the routing rules run without a real UI.
//! The CLI installs the implementations from [`sinks`].

pub mod sinks;

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::constants::{SYSTEM_NOTIFICATION_DISMISS, TOAST_DEFAULT, TOAST_HIGH, TOAST_MEDIUM};
use crate::error::PresentationError;
use crate::notification::{Notification, NotificationId, Priority};
use crate::preferences::{DeliveryChannel, PreferenceStore};

/// Host permission for system notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Notifications may be shown.
    Granted,
    /// The user or host refused.
    Denied,
    /// Not decided yet; the dispatcher asks once per notification.
    Prompt,
}

/// System notification capability.
pub trait SystemNotifier: Send + Sync {
    /// Current permission.
    fn permission(&self) -> Permission;

    /// Ask the host for permission. Hosts without a prompt report the
    /// current state.
    fn request_permission(&self) -> Permission {
        self.permission()
    }

    /// Show a notification.
    fn show(&self, request: &SystemNotificationRequest) -> Result<(), PresentationError>;

    /// Dismiss a previously shown notification. Unknown ids are ignored.
    fn dismiss(&self, id: &NotificationId);
}

/// Audio cue capability.
pub trait SoundPlayer: Send + Sync {
    /// Play the cue for `key`.
    fn play(&self, key: SoundKey) -> Result<(), PresentationError>;
}

/// In-app toast capability.
pub trait ToastPresenter: Send + Sync {
    /// Show a toast.
    fn show(&self, toast: &Toast) -> Result<(), PresentationError>;
}

/// Navigation capability used when a toast is clicked.
pub trait Navigator: Send + Sync {
    /// Navigate to `url`.
    fn navigate(&self, url: &str) -> Result<(), PresentationError>;
}

/// What the system sink is asked to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemNotificationRequest {
    /// Notification id, also used as the replacement tag.
    pub id: NotificationId,
    /// Title line.
    pub title: String,
    /// Body text.
    pub body: String,
    /// Stay on screen until the user dismisses it.
    pub require_interaction: bool,
    /// Link opened on click.
    pub action_url: Option<String>,
}

impl SystemNotificationRequest {
    /// Build the request for `notification`.
    pub fn for_notification(notification: &Notification) -> Self {
        Self {
            id: notification.id.clone(),
            title: notification.title.clone(),
            body: notification.message.clone(),
            require_interaction: notification.priority == Priority::Critical,
            action_url: notification.action_url.clone(),
        }
    }
}

/// Audio cue identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SoundKey {
    /// Critical alert.
    Critical,
    /// High priority.
    High,
    /// Something succeeded.
    Success,
    /// Something failed.
    Error,
    /// A message or chat arrived.
    Message,
    /// Anything else.
    Default,
}

impl SoundKey {
    /// Pick the cue: priority first, then the notification type.
    pub fn for_notification(notification: &Notification) -> Self {
        match notification.priority {
            Priority::Critical => return Self::Critical,
            Priority::High => return Self::High,
            Priority::Low | Priority::Medium => {}
        }
        match notification.kind.as_str() {
            "success" => Self::Success,
            "error" => Self::Error,
            "message" | "chat" => Self::Message,
            _ => Self::Default,
        }
    }

    /// Stable name, e.g. for looking up an audio asset.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Success => "success",
            Self::Error => "error",
            Self::Message => "message",
            Self::Default => "default",
        }
    }
}

/// An in-app toast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    /// Notification id.
    pub id: NotificationId,
    /// Title line.
    pub title: String,
    /// Body text.
    pub message: String,
    /// Priority, for styling.
    pub priority: Priority,
    /// Close automatically after this long; `None` means manual dismiss.
    pub auto_close: Option<Duration>,
    /// Navigated to on click.
    pub action_url: Option<String>,
}

impl Toast {
    /// Build the toast for `notification`.
    pub fn for_notification(notification: &Notification) -> Self {
        Self {
            id: notification.id.clone(),
            title: notification.title.clone(),
            message: notification.message.clone(),
            priority: notification.priority,
            auto_close: toast_duration(notification.priority),
            action_url: notification.action_url.clone(),
        }
    }
}

/// Toast auto-close duration for a priority.
pub fn toast_duration(priority: Priority) -> Option<Duration> {
    match priority {
        Priority::Critical => None,
        Priority::High => Some(TOAST_HIGH),
        Priority::Medium => Some(TOAST_MEDIUM),
        Priority::Low => Some(TOAST_DEFAULT),
    }
}

/// Why a sink was not invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No implementation installed.
    NotInstalled,
    /// Host permission was denied.
    PermissionDenied,
    /// The user disabled this channel for the category.
    DisabledForCategory,
    /// The user disabled sound.
    SoundDisabled,
}

/// Result of one sink for one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutcome {
    /// The sink accepted the notification.
    Delivered,
    /// The sink was not invoked.
    Skipped(SkipReason),
    /// The sink was invoked and failed.
    Failed(PresentationError),
}

impl SinkOutcome {
    /// Whether the sink was actually called.
    pub fn was_invoked(&self) -> bool {
        !matches!(self, Self::Skipped(_))
    }
}

/// Post-dispatch event: what each sink did with one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Notification id.
    pub id: NotificationId,
    /// System notification sink.
    pub system: SinkOutcome,
    /// Sound sink.
    pub sound: SinkOutcome,
    /// Toast sink.
    pub toast: SinkOutcome,
}

/// Fans notifications out to the installed sinks.
pub struct Dispatcher {
    system: Option<Arc<dyn SystemNotifier>>,
    sound: Option<Arc<dyn SoundPlayer>>,
    toast: Option<Arc<dyn ToastPresenter>>,
    navigator: Option<Arc<dyn Navigator>>,
    preferences: PreferenceStore,
    dismiss_after: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("system", &self.system.is_some())
            .field("sound", &self.sound.is_some())
            .field("toast", &self.toast.is_some())
            .field("navigator", &self.navigator.is_some())
            .field("dismiss_after", &self.dismiss_after)
            .finish()
    }
}

impl Dispatcher {
    /// Dispatcher with no sinks installed.
    pub fn new(preferences: PreferenceStore) -> Self {
        Self {
            system: None,
            sound: None,
            toast: None,
            navigator: None,
            preferences,
            dismiss_after: SYSTEM_NOTIFICATION_DISMISS,
        }
    }

    /// Install the system notification sink.
    #[must_use]
    pub fn with_system_notifier(mut self, notifier: Arc<dyn SystemNotifier>) -> Self {
        self.system = Some(notifier);
        self
    }

    /// Install the sound sink.
    #[must_use]
    pub fn with_sound_player(mut self, player: Arc<dyn SoundPlayer>) -> Self {
        self.sound = Some(player);
        self
    }

    /// Install the toast sink.
    #[must_use]
    pub fn with_toast_presenter(mut self, presenter: Arc<dyn ToastPresenter>) -> Self {
        self.toast = Some(presenter);
        self
    }

    /// Install the navigator used for toast clicks.
    #[must_use]
    pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    /// Delay before non-critical system notifications are dismissed.
    #[must_use]
    pub fn with_dismiss_after(mut self, delay: Duration) -> Self {
        self.dismiss_after = delay;
        self
    }

    /// Preferences consulted on every dispatch.
    pub fn preferences(&self) -> &PreferenceStore {
        &self.preferences
    }

    /// Present `notification` on every matching sink.
    pub fn dispatch(&self, notification: &Notification) -> DispatchReport {
        let report = DispatchReport {
            id: notification.id.clone(),
            system: self.present_system(notification),
            sound: self.play_sound(notification),
            toast: self.show_toast(notification),
        };
        log::debug!(
            "[Dispatch] {} -> system={:?} sound={:?} toast={:?}",
            report.id,
            report.system,
            report.sound,
            report.toast
        );
        report
    }

    /// Handle a toast click. Returns `true` if navigation happened.
    pub fn toast_clicked(&self, toast: &Toast) -> bool {
        let Some(url) = toast.action_url.as_deref() else {
            return false;
        };
        let Some(navigator) = &self.navigator else {
            log::debug!("[Dispatch] No navigator installed, ignoring click on {}", toast.id);
            return false;
        };
        match isolate("navigator", || navigator.navigate(url)) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[Dispatch] Navigation to {} failed: {}", url, e);
                false
            }
        }
    }

    fn present_system(&self, notification: &Notification) -> SinkOutcome {
        let Some(notifier) = &self.system else {
            return SinkOutcome::Skipped(SkipReason::NotInstalled);
        };
        if !self
            .preferences
            .allows(&notification.category, DeliveryChannel::Push)
        {
            return SinkOutcome::Skipped(SkipReason::DisabledForCategory);
        }

        let permission = catch_unwind(AssertUnwindSafe(|| match notifier.permission() {
            Permission::Prompt => notifier.request_permission(),
            other => other,
        }))
        .unwrap_or_else(|panic| {
            log::error!(
                "[Dispatch] Permission check panicked: {}",
                panic_message(panic.as_ref())
            );
            Permission::Denied
        });
        if permission != Permission::Granted {
            log::debug!("[Dispatch] System notifications not permitted ({:?})", permission);
            return SinkOutcome::Skipped(SkipReason::PermissionDenied);
        }

        let request = SystemNotificationRequest::for_notification(notification);
        let outcome = match isolate("system notifier", || notifier.show(&request)) {
            Ok(()) => SinkOutcome::Delivered,
            Err(e) => {
                log::warn!("[Dispatch] System notification for {} failed: {}", request.id, e);
                SinkOutcome::Failed(e)
            }
        };

        if !request.require_interaction {
            self.schedule_dismiss(Arc::clone(notifier), request.id);
        }
        outcome
    }

    fn schedule_dismiss(&self, notifier: Arc<dyn SystemNotifier>, id: NotificationId) {
        let delay = self.dismiss_after;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| notifier.dismiss(&id))) {
                        log::warn!(
                            "[Dispatch] Dismiss of {} panicked: {}",
                            id,
                            panic_message(panic.as_ref())
                        );
                    }
                });
            }
            Err(_) => {
                log::debug!("[Dispatch] No runtime, {} will not auto-dismiss", id);
            }
        }
    }

    fn play_sound(&self, notification: &Notification) -> SinkOutcome {
        let Some(player) = &self.sound else {
            return SinkOutcome::Skipped(SkipReason::NotInstalled);
        };
        if !self.preferences.sound_enabled() {
            return SinkOutcome::Skipped(SkipReason::SoundDisabled);
        }
        let key = SoundKey::for_notification(notification);
        match isolate("sound player", || player.play(key)) {
            Ok(()) => SinkOutcome::Delivered,
            Err(e) => {
                log::warn!("[Dispatch] Sound '{}' failed: {}", key.as_str(), e);
                SinkOutcome::Failed(e)
            }
        }
    }

    fn show_toast(&self, notification: &Notification) -> SinkOutcome {
        let Some(presenter) = &self.toast else {
            return SinkOutcome::Skipped(SkipReason::NotInstalled);
        };
        let toast = Toast::for_notification(notification);
        match isolate("toast presenter", || presenter.show(&toast)) {
            Ok(()) => SinkOutcome::Delivered,
            Err(e) => {
                log::warn!("[Dispatch] Toast for {} failed: {}", notification.id, e);
                SinkOutcome::Failed(e)
            }
        }
    }
}

/// Run one sink call, turning a panic into a [`PresentationError::Sink`].
fn isolate(
    sink: &str,
    call: impl FnOnce() -> Result<(), PresentationError>,
) -> Result<(), PresentationError> {
    catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|panic| {
        Err(PresentationError::Sink(format!(
            "{sink} panicked: {}",
            panic_message(panic.as_ref())
        )))
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::notification::fixtures::notification;
    use crate::preferences::{ChannelToggles, Preferences};

    #[derive(Default)]
    struct Recorder {
        shown: Mutex<Vec<SystemNotificationRequest>>,
        dismissed: Mutex<Vec<NotificationId>>,
        sounds: Mutex<Vec<SoundKey>>,
        toasts: Mutex<Vec<Toast>>,
        visits: Mutex<Vec<String>>,
        permission: Option<Permission>,
        fail_system: bool,
        fail_sound: bool,
    }

    impl SystemNotifier for Recorder {
        fn permission(&self) -> Permission {
            self.permission.unwrap_or(Permission::Granted)
        }

        fn show(&self, request: &SystemNotificationRequest) -> Result<(), PresentationError> {
            self.shown.lock().unwrap().push(request.clone());
            if self.fail_system {
                return Err(PresentationError::Sink("gone".into()));
            }
            Ok(())
        }

        fn dismiss(&self, id: &NotificationId) {
            self.dismissed.lock().unwrap().push(id.clone());
        }
    }

    impl SoundPlayer for Recorder {
        fn play(&self, key: SoundKey) -> Result<(), PresentationError> {
            self.sounds.lock().unwrap().push(key);
            if self.fail_sound {
                return Err(PresentationError::Playback("autoplay blocked".into()));
            }
            Ok(())
        }
    }

    impl ToastPresenter for Recorder {
        fn show(&self, toast: &Toast) -> Result<(), PresentationError> {
            self.toasts.lock().unwrap().push(toast.clone());
            Ok(())
        }
    }

    impl Navigator for Recorder {
        fn navigate(&self, url: &str) -> Result<(), PresentationError> {
            self.visits.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    fn dispatcher(recorder: &Arc<Recorder>, preferences: Preferences) -> Dispatcher {
        Dispatcher::new(PreferenceStore::new(preferences))
            .with_system_notifier(recorder.clone())
            .with_sound_player(recorder.clone())
            .with_toast_presenter(recorder.clone())
            .with_navigator(recorder.clone())
    }

    #[test]
    fn test_critical_with_sound_disabled() {
        let recorder = Arc::new(Recorder::default());
        let prefs = Preferences {
            sound_enabled: false,
            ..Default::default()
        };
        let n1 = notification("n1", Priority::Critical, "order-status");

        let report = dispatcher(&recorder, prefs).dispatch(&n1);

        assert_eq!(report.system, SinkOutcome::Delivered);
        assert!(recorder.shown.lock().unwrap()[0].require_interaction);
        assert_eq!(report.sound, SinkOutcome::Skipped(SkipReason::SoundDisabled));
        assert!(recorder.sounds.lock().unwrap().is_empty());
        assert_eq!(report.toast, SinkOutcome::Delivered);
        assert_eq!(recorder.toasts.lock().unwrap()[0].auto_close, None);
    }

    #[test]
    fn test_sound_key_mapping() {
        let key = |p, t| SoundKey::for_notification(&notification("x", p, t));
        assert_eq!(key(Priority::Critical, "success"), SoundKey::Critical);
        assert_eq!(key(Priority::High, "chat"), SoundKey::High);
        assert_eq!(key(Priority::Medium, "success"), SoundKey::Success);
        assert_eq!(key(Priority::Low, "error"), SoundKey::Error);
        assert_eq!(key(Priority::Medium, "message"), SoundKey::Message);
        assert_eq!(key(Priority::Medium, "chat"), SoundKey::Message);
        assert_eq!(key(Priority::Medium, "order-status"), SoundKey::Default);
    }

    #[test]
    fn test_toast_durations() {
        assert_eq!(toast_duration(Priority::Critical), None);
        assert_eq!(toast_duration(Priority::High), Some(Duration::from_secs(10)));
        assert_eq!(toast_duration(Priority::Medium), Some(Duration::from_secs(7)));
        assert_eq!(toast_duration(Priority::Low), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_permission_denied_skips_only_system_sink() {
        let recorder = Arc::new(Recorder {
            permission: Some(Permission::Denied),
            ..Default::default()
        });
        let report = dispatcher(&recorder, Preferences::default())
            .dispatch(&notification("n2", Priority::High, "order-status"));

        assert_eq!(report.system, SinkOutcome::Skipped(SkipReason::PermissionDenied));
        assert_eq!(report.sound, SinkOutcome::Delivered);
        assert_eq!(report.toast, SinkOutcome::Delivered);
    }

    #[test]
    fn test_category_preference_disables_system_sink() {
        let recorder = Arc::new(Recorder::default());
        let mut prefs = Preferences::default();
        prefs.categories.insert(
            "orders".into(),
            ChannelToggles {
                push: false,
                ..Default::default()
            },
        );

        let report = dispatcher(&recorder, prefs)
            .dispatch(&notification("n3", Priority::Medium, "order-status"));

        assert_eq!(report.system, SinkOutcome::Skipped(SkipReason::DisabledForCategory));
        assert!(recorder.shown.lock().unwrap().is_empty());
        assert_eq!(report.toast, SinkOutcome::Delivered);
    }

    struct PanickingPlayer;

    impl SoundPlayer for PanickingPlayer {
        fn play(&self, _key: SoundKey) -> Result<(), PresentationError> {
            panic!("audio device vanished");
        }
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(&recorder, Preferences::default())
            .with_sound_player(Arc::new(PanickingPlayer));

        let report = dispatcher.dispatch(&notification("p1", Priority::High, "order-status"));
        assert_eq!(
            report.sound,
            SinkOutcome::Failed(PresentationError::Sink(
                "sound player panicked: audio device vanished".into()
            ))
        );
        assert_eq!(report.system, SinkOutcome::Delivered);
        assert_eq!(report.toast, SinkOutcome::Delivered);

        // The dispatcher keeps working afterwards.
        let report = dispatcher.dispatch(&notification("p2", Priority::Low, "order-status"));
        assert_eq!(report.toast, SinkOutcome::Delivered);
        assert_eq!(recorder.toasts.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_failing_sinks_do_not_block_others() {
        let recorder = Arc::new(Recorder {
            fail_system: true,
            fail_sound: true,
            ..Default::default()
        });
        let report = dispatcher(&recorder, Preferences::default())
            .dispatch(&notification("n4", Priority::Medium, "message"));

        assert!(matches!(report.system, SinkOutcome::Failed(_)));
        assert_eq!(
            report.sound,
            SinkOutcome::Failed(PresentationError::Playback("autoplay blocked".into()))
        );
        assert_eq!(report.toast, SinkOutcome::Delivered);
        assert_eq!(recorder.toasts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_sinks_are_skipped() {
        let report = Dispatcher::new(PreferenceStore::default())
            .dispatch(&notification("n5", Priority::Low, "info"));
        assert_eq!(report.system, SinkOutcome::Skipped(SkipReason::NotInstalled));
        assert_eq!(report.sound, SinkOutcome::Skipped(SkipReason::NotInstalled));
        assert_eq!(report.toast, SinkOutcome::Skipped(SkipReason::NotInstalled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_critical_auto_dismiss_even_after_failure() {
        let recorder = Arc::new(Recorder {
            fail_system: true,
            ..Default::default()
        });
        let dispatcher = dispatcher(&recorder, Preferences::default());
        dispatcher.dispatch(&notification("n6", Priority::High, "info"));
        dispatcher.dispatch(&notification("n7", Priority::Critical, "info"));

        tokio::time::sleep(SYSTEM_NOTIFICATION_DISMISS + Duration::from_millis(10)).await;

        let dismissed = recorder.dismissed.lock().unwrap().clone();
        assert_eq!(dismissed, vec![NotificationId::from("n6")]);
    }

    #[test]
    fn test_toast_click_navigates_when_url_present() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(&recorder, Preferences::default());

        let mut with_url = notification("n8", Priority::Low, "info");
        with_url.action_url = Some("/orders/8".into());
        assert!(dispatcher.toast_clicked(&Toast::for_notification(&with_url)));

        let without_url = notification("n9", Priority::Low, "info");
        assert!(!dispatcher.toast_clicked(&Toast::for_notification(&without_url)));

        assert_eq!(*recorder.visits.lock().unwrap(), vec!["/orders/8".to_string()]);
    }
}
