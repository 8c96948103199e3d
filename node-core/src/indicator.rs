//! Status LED patterns driven by bus events.

use crate::events::{Event, EventBus, EventHandler, Topic};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

pub const PATTERN_STEPS: u32 = 16;

/// A 16-step blink pattern, most significant bit first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    Ok,
    FastBlink,
    SlowBlink,
    Off,
    Error,
    ThreeBlink,
}

impl LedPattern {
    pub fn mask(self) -> u16 {
        match self {
            LedPattern::Ok => 0xFFFF,
            LedPattern::FastBlink => 0xAAAA,
            LedPattern::SlowBlink => 0xCCCC,
            LedPattern::Off => 0x0000,
            LedPattern::Error => 0xCC00,
            LedPattern::ThreeBlink => 0xA800,
        }
    }

    /// Whether the LED is lit at `step` (wraps every 16 steps).
    pub fn level_at(self, step: u32) -> bool {
        let bit = PATTERN_STEPS - 1 - (step % PATTERN_STEPS);
        self.mask() & (1 << bit) != 0
    }
}

/// Keeps the current pattern in sync with connectivity and button events.
pub struct StatusIndicator {
    pattern: Mutex<LedPattern>,
}

impl Default for StatusIndicator {
    fn default() -> Self {
        Self {
            pattern: Mutex::new(LedPattern::Off),
        }
    }
}

impl StatusIndicator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        for topic in [Topic::ConnectivityChanged, Topic::ButtonShortPress, Topic::ButtonLongPress] {
            bus.subscribe(topic, self.clone());
        }
    }

    pub fn pattern(&self) -> LedPattern {
        *self.pattern.lock()
    }

    fn apply(&self, event: &Event) {
        let mut pattern = self.pattern.lock();
        let next = match event {
            Event::ConnectivityChanged(snapshot) if snapshot.client_status == 0 => LedPattern::Ok,
            Event::ConnectivityChanged(_) => LedPattern::Error,
            Event::ButtonShortPress if *pattern == LedPattern::SlowBlink => LedPattern::FastBlink,
            Event::ButtonShortPress => LedPattern::SlowBlink,
            Event::ButtonLongPress => LedPattern::ThreeBlink,
            Event::RestartRequested => return,
        };
        if next != *pattern {
            tracing::debug!(from = ?*pattern, to = ?next, "Status LED pattern changed");
            *pattern = next;
        }
    }
}

#[async_trait]
impl EventHandler for StatusIndicator {
    async fn handle(&self, event: &Event) {
        self.apply(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ConnectivityMode, ConnectivitySnapshot};

    fn connectivity(client_status: u8) -> Event {
        Event::ConnectivityChanged(ConnectivitySnapshot {
            mode: ConnectivityMode::Client,
            client_status,
            ..ConnectivitySnapshot::default()
        })
    }

    #[test]
    fn test_pattern_levels() {
        assert!((0..16).all(|step| LedPattern::Ok.level_at(step)));
        assert!((0..16).all(|step| !LedPattern::Off.level_at(step)));
        let three: Vec<bool> = (0..6).map(|step| LedPattern::ThreeBlink.level_at(step)).collect();
        assert_eq!(three, vec![true, false, true, false, true, false]);
        assert_eq!(LedPattern::FastBlink.level_at(16), LedPattern::FastBlink.level_at(0));
    }

    #[test]
    fn test_connectivity_maps_to_ok_or_error() {
        let indicator = StatusIndicator::default();
        indicator.apply(&connectivity(0));
        assert_eq!(indicator.pattern(), LedPattern::Ok);
        indicator.apply(&connectivity(201));
        assert_eq!(indicator.pattern(), LedPattern::Error);
    }

    #[test]
    fn test_short_press_toggles_blink_speed() {
        let indicator = StatusIndicator::default();
        indicator.apply(&Event::ButtonShortPress);
        assert_eq!(indicator.pattern(), LedPattern::SlowBlink);
        indicator.apply(&Event::ButtonShortPress);
        assert_eq!(indicator.pattern(), LedPattern::FastBlink);
        indicator.apply(&Event::ButtonShortPress);
        assert_eq!(indicator.pattern(), LedPattern::SlowBlink);
        indicator.apply(&Event::ButtonLongPress);
        assert_eq!(indicator.pattern(), LedPattern::ThreeBlink);
    }

    #[tokio::test]
    async fn test_follows_bus_events() {
        let bus = EventBus::new(4);
        let indicator = StatusIndicator::new();
        indicator.attach(&bus);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe_fn(Topic::ButtonLongPress, move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
            }
        });
        bus.start().unwrap();

        bus.publish(Event::ButtonLongPress);
        rx.recv().await;
        assert_eq!(indicator.pattern(), LedPattern::ThreeBlink);
    }
}
