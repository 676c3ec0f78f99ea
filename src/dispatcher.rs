//! The background thread that keeps a [`crate::DeviceManager`]'s cache in
//! sync with the bus without ever blocking a public API call on it.

use crate::bus::BusClient;
use crate::config::DeviceManagerConfig;
use crate::event::Event;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Owns the background thread. Dropping or calling [`Dispatcher::stop`]
/// asks the thread to exit and joins it; the thread never outlives its
/// `DeviceManager`.
pub(crate) struct Dispatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns the thread. `on_events` is called with every batch of
    /// [`Event`]s pulled off the bus in one tick; `on_error` is called
    /// whenever a `process()` tick itself fails. Both run on the
    /// Dispatcher thread and must not block.
    pub(crate) fn spawn(
        bus: Arc<BusClient>,
        config: DeviceManagerConfig,
        on_events: impl Fn(Vec<Event>) + Send + 'static,
        on_error: impl Fn(&Error) + Send + 'static,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("bluez-core-dispatcher".into())
            .spawn(move || run(bus, config, thread_stop, on_events, on_error))
            .map_err(|e| crate::Error::Thread(e.to_string()))?;
        Ok(Self { stop, handle: Some(handle) })
    }

    /// Signals the thread to exit and blocks until it has. Idempotent.
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    bus: Arc<BusClient>,
    config: DeviceManagerConfig,
    stop: Arc<AtomicBool>,
    on_events: impl Fn(Vec<Event>),
    on_error: impl Fn(&Error),
) {
    while !stop.load(Ordering::SeqCst) {
        if let Err(err) = bus.pump(idle_budget(&config)) {
            log::warn!("dispatcher pump failed: {err}");
            on_error(&err);
        }
        let events = bus.drain_events(config.max_drain_per_tick);
        let drained_full_batch = events.len() == config.max_drain_per_tick;
        if !events.is_empty() {
            on_events(events);
        }
        if !drained_full_batch {
            std::thread::sleep(config.idle_sleep);
        }
    }
}

fn idle_budget(config: &DeviceManagerConfig) -> Duration {
    config.idle_sleep.min(Duration::from_millis(10))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_budget_never_exceeds_ten_millis() {
        let mut cfg = DeviceManagerConfig::default();
        cfg.idle_sleep = Duration::from_secs(1);
        assert!(idle_budget(&cfg) <= Duration::from_millis(10));
    }
}
