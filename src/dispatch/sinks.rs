//! Terminal sinks used by the `herald` binary.
//!
//! A headless process has no notification center or audio device, so the
//! system sink logs, the sound sink rings the terminal bell and toasts are
//! printed to stdout.

use std::io::Write;
use std::sync::Mutex;

use super::{
    Navigator, Permission, SoundKey, SoundPlayer, SystemNotificationRequest, SystemNotifier,
    Toast, ToastPresenter,
};
use crate::error::PresentationError;
use crate::notification::{NotificationId, Priority};

/// System notifier that writes to the log.
#[derive(Debug)]
pub struct LogNotifier {
    permission: Permission,
    visible: Mutex<Vec<NotificationId>>,
}

impl LogNotifier {
    /// Create a notifier that reports `permission`.
    pub fn new(permission: Permission) -> Self {
        Self {
            permission,
            visible: Mutex::new(Vec::new()),
        }
    }

    /// Ids currently "on screen".
    pub fn visible(&self) -> Vec<NotificationId> {
        self.visible
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new(Permission::Granted)
    }
}

impl SystemNotifier for LogNotifier {
    fn permission(&self) -> Permission {
        self.permission
    }

    fn show(&self, request: &SystemNotificationRequest) -> Result<(), PresentationError> {
        log::info!(
            "[Notify] {}{}: {}",
            if request.require_interaction { "(sticky) " } else { "" },
            request.title,
            request.body
        );
        self.visible
            .lock()
            .map_err(|e| PresentationError::Sink(format!("notifier state poisoned: {e}")))?
            .push(request.id.clone());
        Ok(())
    }

    fn dismiss(&self, id: &NotificationId) {
        if let Ok(mut visible) = self.visible.lock() {
            visible.retain(|shown| shown != id);
        }
        log::debug!("[Notify] Dismissed {}", id);
    }
}

/// Sound player that rings the terminal bell.
///
/// Only critical and high cues ring; the rest would be noise in a terminal.
#[derive(Debug, Default)]
pub struct TerminalBell;

impl SoundPlayer for TerminalBell {
    fn play(&self, key: SoundKey) -> Result<(), PresentationError> {
        if !matches!(key, SoundKey::Critical | SoundKey::High) {
            log::trace!("[Sound] Skipping quiet cue '{}'", key.as_str());
            return Ok(());
        }
        let mut stderr = std::io::stderr();
        stderr
            .write_all(b"\x07")
            .and_then(|()| stderr.flush())
            .map_err(|e| PresentationError::Playback(e.to_string()))
    }
}

/// Toast presenter that prints one line per toast.
#[derive(Debug, Default)]
pub struct ConsoleToasts;

impl ToastPresenter for ConsoleToasts {
    fn show(&self, toast: &Toast) -> Result<(), PresentationError> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", format_toast(toast))
            .map_err(|e| PresentationError::Sink(e.to_string()))
    }
}

fn format_toast(toast: &Toast) -> String {
    let badge = match toast.priority {
        Priority::Critical => "!!",
        Priority::High => "! ",
        Priority::Medium => "* ",
        Priority::Low => "  ",
    };
    let mut line = format!("{badge} {} - {}", toast.title, toast.message);
    if let Some(url) = &toast.action_url {
        line.push_str(&format!(" <{url}>"));
    }
    line
}

/// Navigator that logs the target.
#[derive(Debug, Default)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, url: &str) -> Result<(), PresentationError> {
        log::info!("[Navigate] {}", url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::fixtures::notification;

    #[test]
    fn test_log_notifier_tracks_visible() {
        let notifier = LogNotifier::default();
        let n = notification("n1", Priority::High, "info");
        notifier
            .show(&SystemNotificationRequest::for_notification(&n))
            .unwrap();
        assert_eq!(notifier.visible(), vec![n.id.clone()]);

        notifier.dismiss(&n.id);
        assert!(notifier.visible().is_empty());
    }

    #[test]
    fn test_format_toast() {
        let mut n = notification("n1", Priority::Critical, "info");
        n.action_url = Some("/orders/1".into());
        assert_eq!(
            format_toast(&Toast::for_notification(&n)),
            "!! title n1 - message n1 </orders/1>"
        );
    }

    #[test]
    fn test_quiet_cues_do_not_ring() {
        assert!(TerminalBell.play(SoundKey::Default).is_ok());
    }
}
