//! Capability sinks a host implements to observe cache and connection
//! activity, in place of a `void*` user-data pointer and a table of
//! function pointers.
//!
//! Every method defaults to doing nothing, so a host only overrides the
//! handful it cares about.

use crate::address::Address;
use crate::config::ConnectionState;
use crate::device::Device;
use crate::Error;

/// Observes device discovery activity on a [`crate::DeviceManager`].
///
/// Implementations run on the Dispatcher thread and must not block; do any
/// slow work by handing it off elsewhere.
pub trait DiscoverySink: Send + Sync {
    /// A device was added to the cache, or an existing entry changed.
    fn on_discovered(&self, device: &Device) {
        let _ = device;
    }
    /// Scanning started or stopped, whether host-initiated or not.
    fn on_scan_status(&self, scanning: bool) {
        let _ = scanning;
    }
    /// A cache operation or bus call failed. The manager keeps running.
    fn on_error(&self, error: &Error) {
        let _ = error;
    }
}

/// Observes connection and pairing activity on a [`crate::ConnectionManager`].
pub trait ConnectionSink: Send + Sync {
    /// The tracked state for `address` changed.
    fn on_state_changed(&self, address: Address, state: ConnectionState) {
        let _ = (address, state);
    }
    /// A `Pair` call completed, successfully or not.
    fn on_pairing_result(&self, address: Address, result: &crate::Result<()>) {
        let _ = (address, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(AtomicUsize);

    impl DiscoverySink for CountingSink {
        fn on_discovered(&self, _device: &Device) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn default_methods_are_no_ops() {
        struct Silent;
        impl DiscoverySink for Silent {}
        impl ConnectionSink for Silent {}
        let sink = Silent;
        sink.on_scan_status(true);
        sink.on_error(&Error::OutOfMemory);
        sink.on_state_changed(Address::default(), ConnectionState::Connected);
        sink.on_pairing_result(Address::default(), &Ok(()));
    }

    #[test]
    fn overridden_method_runs() {
        let sink = CountingSink(AtomicUsize::new(0));
        let device = Device::from_properties(&crate::event::property_map(vec![(
            "Address",
            crate::properties::PropertyValue::Str("11:22:33:44:55:66".into()),
        )]))
        .unwrap();
        sink.on_discovered(&device);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }
}
