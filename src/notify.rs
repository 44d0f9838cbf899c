//! User-facing status and failure reporting.
//!
//! The engine never renders UI itself; it hands short texts to a
//! [`NotificationSink`] and lets the surrounding bot decide how to show them.

use crate::event::{Event, EventBus};
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle to a reported error, so the caller can later edit or delete it.
pub type ErrorId = u64;

#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// Plain informational text
    Info { text: String },

    /// Failure report. Persistent errors should stay visible until dismissed.
    Error {
        id: ErrorId,
        text: String,
        persistent: bool,
    },
}

pub trait NotificationSink: Send + Sync {
    fn send_notification(&self, text: &str);

    fn send_error(&self, text: &str, persistent: bool) -> ErrorId;
}

/// Publishes notifications on a guild's event bus for any subscribed UI.
pub struct BusNotifier {
    bus: EventBus,
    next_id: AtomicU64,
}

impl BusNotifier {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            next_id: AtomicU64::new(0),
        }
    }
}

impl NotificationSink for BusNotifier {
    fn send_notification(&self, text: &str) {
        self.bus.send(Event::Notification(Notification::Info {
            text: text.to_string(),
        }));
    }

    fn send_error(&self, text: &str, persistent: bool) -> ErrorId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        warn!("Reporting error {id}: {text}");
        self.bus.send(Event::Notification(Notification::Error {
            id,
            text: text.to_string(),
            persistent,
        }));
        id
    }
}
