use log::{error, info, warn};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Error => write!(f, "error"),
        }
    }
}

/// Alert sink. Implementations forward to chat/email; delivery is best effort.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, level: AlertLevel);
}

/// Writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str, level: AlertLevel) {
        match level {
            AlertLevel::Info => info!("[alert] {message}"),
            AlertLevel::Warning => warn!("[alert] {message}"),
            AlertLevel::Error => error!("[alert] {message}"),
        }
    }
}
