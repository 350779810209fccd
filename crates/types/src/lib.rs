#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, Ordering};

/// Latest externally requested power target in percent of nominal.
///
/// Written by the broker delivery context, read by the setpoint write cycle.
/// Last write wins; no history is kept.
#[derive(Debug)]
pub struct SetpointCell {
    target: AtomicI64,
}

impl SetpointCell {
    pub fn new(default: i64) -> Self {
        Self {
            target: AtomicI64::new(default),
        }
    }

    pub fn set(&self, value: i64) {
        self.target.store(value, Ordering::Release);
    }

    pub fn get(&self) -> i64 {
        self.target.load(Ordering::Acquire)
    }
}

/// Topic layout shared by the publisher and the last-will registration.
pub mod topics {
    pub const ONLINE_PAYLOAD: &str = "online";
    pub const OFFLINE_PAYLOAD: &str = "offline";

    pub fn status_topic(namespace: &str) -> String {
        format!("{namespace}/online")
    }

    pub fn reading_topic(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }
}
