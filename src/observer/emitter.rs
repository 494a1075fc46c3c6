use std::sync::Mutex;

use event_emitter_rs::EventEmitter;

use super::{DeliveryEvent, Observer};

/// Re-emits events through an [`EventEmitter`] for in-process listeners.
///
/// Listeners subscribe by event name (`"delivery.acknowledged"`, ...) and
/// receive the event as a JSON string.
pub struct EmitterObserver {
    emitter: Mutex<EventEmitter>,
}

impl EmitterObserver {
    pub fn new(emitter: EventEmitter) -> Self {
        EmitterObserver {
            emitter: Mutex::new(emitter),
        }
    }
}

impl Observer for EmitterObserver {
    fn record(&self, event: &DeliveryEvent) {
        let Ok(payload) = event.to_json() else {
            return;
        };
        if let Ok(mut emitter) = self.emitter.lock() {
            emitter.emit(event.name(), payload);
        }
    }
}
