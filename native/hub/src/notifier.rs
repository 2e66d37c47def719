use std::time::Duration;

use updater::models::{LogNotifier, Notification, Notifier};

use crate::signals::system::Toast;

/// Shows updater notifications as toasts; the Dart side localizes the keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToastNotifier;

impl ToastNotifier {
    fn duration(notification: Notification) -> Option<Duration> {
        match notification {
            Notification::UpdateFinished => None,
            _ => Some(Duration::from_secs(8)),
        }
    }
}

impl Notifier for ToastNotifier {
    fn notify(&self, notification: Notification) {
        LogNotifier.notify(notification);
        Toast::send(
            notification.title_key().to_string(),
            notification.message_key().to_string(),
            notification.is_error(),
            Self::duration(notification),
        );
    }
}
