//! Notification fan-out.
//!
//! The [`Notifier`] broadcasts each rule-emitted [`Notification`] to
//! every currently registered receiver, synchronously and in registry
//! order. Receivers are independent: one blowing up is caught, logged,
//! and does not stop delivery to the rest. Delivery is best-effort;
//! there is no acknowledgement or retry.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::error;

use crate::registry::ReceiverRegistry;
use crate::rules::Notification;

pub struct Notifier {
    receivers: Arc<ReceiverRegistry>,
}

impl Notifier {
    pub fn new(receivers: Arc<ReceiverRegistry>) -> Self {
        Self { receivers }
    }

    /// The receiver registry backing this notifier.
    pub fn receivers(&self) -> &Arc<ReceiverRegistry> {
        &self.receivers
    }

    /// Delivers `notification` to every registered receiver.
    pub fn broadcast(&self, notification: &Notification) {
        for receiver in &self.receivers.snapshot() {
            let delivery = catch_unwind(AssertUnwindSafe(|| receiver.receive(notification)));
            if delivery.is_err() {
                error!(
                    "notification receiver panicked on topic {:?} from {:?}",
                    notification.topic, notification.sender
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::NotificationReceiver;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        seen: Arc<Mutex<Vec<(&'static str, String)>>>,
    }

    impl NotificationReceiver for Recorder {
        fn receive(&self, notification: &Notification) {
            self.seen
                .lock()
                .unwrap()
                .push((self.label, notification.topic.clone()));
        }
    }

    struct Exploder;

    impl NotificationReceiver for Exploder {
        fn receive(&self, _notification: &Notification) {
            panic!("boom");
        }
    }

    fn notification(topic: &str) -> Notification {
        Notification::new(topic, serde_json::json!({}), "test")
    }

    #[test]
    fn broadcast_reaches_receivers_in_registry_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let receivers = ReceiverRegistry::new("receivers");
        receivers.register(Arc::new(Recorder {
            label: "first",
            seen: seen.clone(),
        }));
        receivers.register(Arc::new(Recorder {
            label: "second",
            seen: seen.clone(),
        }));

        Notifier::new(receivers).broadcast(&notification("t"));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![("first", "t".to_string()), ("second", "t".to_string())]
        );
    }

    #[test]
    fn a_panicking_receiver_does_not_block_the_rest() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let receivers = ReceiverRegistry::new("receivers");
        receivers.register(Arc::new(Exploder));
        receivers.register(Arc::new(Recorder {
            label: "survivor",
            seen: seen.clone(),
        }));

        Notifier::new(receivers).broadcast(&notification("t"));

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn broadcast_with_no_receivers_is_a_no_op() {
        let notifier = Notifier::new(ReceiverRegistry::new("receivers"));
        notifier.broadcast(&notification("t"));
    }
}
