//! Terminal notification sink used by the CLI

use colored::Colorize;

use crate::engine::updater::capabilities::{Notification, NotificationKind, NotificationSink};

pub struct ConsoleNotifier {
    enabled: bool,
}

impl ConsoleNotifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl NotificationSink for ConsoleNotifier {
    fn permitted(&self) -> bool {
        self.enabled
    }

    fn post(&self, notification: &Notification) {
        let title = match notification.kind {
            NotificationKind::UpdateAvailable => notification.title.cyan().bold(),
            NotificationKind::ReadyToInstall => notification.title.green().bold(),
            NotificationKind::SignerChanged => notification.title.yellow().bold(),
            NotificationKind::VerificationFailed => notification.title.red().bold(),
        };
        eprintln!("{} {}", title, notification.body);
    }
}
