use std::sync::{Arc, Mutex};

use super::{DeliveryEvent, Observer};

/// An observer that prints events to stdout or keeps them in a buffer.
pub struct LogObserver {
    buffer: Option<Arc<Mutex<Vec<String>>>>,
}

impl Default for LogObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl LogObserver {
    pub fn new() -> Self {
        LogObserver { buffer: None }
    }

    pub fn with_buffer(buffer: Arc<Mutex<Vec<String>>>) -> Self {
        LogObserver {
            buffer: Some(buffer),
        }
    }
}

impl Observer for LogObserver {
    fn record(&self, event: &DeliveryEvent) {
        let body = event.to_json().unwrap_or_else(|e| format!("<unserializable: {e}>"));
        let line = format!("[DELIVERY] {} {}", event.name(), body);
        match &self.buffer {
            // A poisoned buffer only loses log lines.
            Some(buffer) => {
                if let Ok(mut buffer) = buffer.lock() {
                    buffer.push(line);
                }
            }
            None => println!("{}", line),
        }
    }
}
