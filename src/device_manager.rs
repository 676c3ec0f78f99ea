//! The device cache: discovery control plus signal-driven ingest.

use crate::address::{path_of, Address};
use crate::bus::{select_adapter, BusClient};
use crate::callbacks::DiscoverySink;
use crate::config::DeviceManagerConfig;
use crate::device::Device;
use crate::dispatcher::Dispatcher;
use crate::event::Event;
use crate::properties::PropertyMap;
use crate::{Error, Result};
use dbus::arg::{RefArg, Variant};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Inner {
    devices: HashMap<Address, Device>,
    scanning: bool,
    /// Bumped on every `start_discovery`; lets a stale scan-duration timer
    /// recognize that the scan it was bounding already ended and not stop
    /// a later, unrelated one.
    scan_generation: u64,
    /// The selected adapter's object path, or `None` if no adapter was
    /// present at construction or the daemon has since removed it.
    /// Guarded by the same lock as the rest of this manager's state so a
    /// concurrent `AdapterRemoved` signal and an in-flight API call never
    /// observe it torn.
    adapter_path: Option<String>,
}

struct NoopSink;
impl DiscoverySink for NoopSink {}

/// Lets a [`crate::ConnectionManager`] sharing this manager's bus session
/// learn about daemon-reported property changes — specifically
/// `Connected` — without installing its own competing match rules.
/// Implemented by [`crate::ConnectionManager`] and attached with
/// [`DeviceManager::attach_connection_manager`].
pub(crate) trait ConnectionObserver: Send + Sync {
    fn on_property_changed(&self, address: Address, changed: &PropertyMap);
}

/// Owns the device cache and the discovery session against a single
/// adapter. Safe to share across threads: every public method takes
/// `&self`.
///
/// Construction picks the first adapter the daemon reports and never polls
/// for a later one. If no adapter is present at construction time,
/// [`DeviceManager::new`] still succeeds — a warning is reported through
/// `on_error` and the manager remains usable for inspection-only
/// operations ([`DeviceManager::list_devices`], [`DeviceManager::get_device`])
/// until an adapter appears; discovery and adapter-scoped calls fail with
/// a daemon error in the meantime.
pub struct DeviceManager {
    bus: Arc<BusClient>,
    config: DeviceManagerConfig,
    inner: Arc<Mutex<Inner>>,
    sink: Arc<dyn DiscoverySink>,
    observer: Arc<Mutex<Option<Arc<dyn ConnectionObserver>>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl DeviceManager {
    /// Opens a bus session, selects the first managed adapter, and starts
    /// the background Dispatcher. The cache begins empty: devices appear
    /// only as the daemon reports them, starting with whatever
    /// `StartDiscovery` or an already-running scan produces.
    pub fn new(config: DeviceManagerConfig, sink: Option<Arc<dyn DiscoverySink>>) -> Result<Self> {
        let bus = Arc::new(BusClient::new()?);
        let objects = bus.managed_object_interfaces(config.adapter_call_timeout)?;
        let adapter_path = select_adapter(&objects);

        let inner = Arc::new(Mutex::new(Inner { devices: HashMap::new(), scanning: false, scan_generation: 0, adapter_path }));
        let sink = sink.unwrap_or_else(|| Arc::new(NoopSink) as Arc<dyn DiscoverySink>);
        if inner.lock().expect("device cache mutex poisoned").adapter_path.is_none() {
            let err = Error::daemon("NoAdapter", "no Bluetooth adapter is present");
            log::warn!("{err}; the manager remains usable for inspection-only operations until one appears");
            sink.on_error(&err);
        }
        let observer: Arc<Mutex<Option<Arc<dyn ConnectionObserver>>>> = Arc::new(Mutex::new(None));

        let dispatcher_inner = inner.clone();
        let dispatcher_sink = sink.clone();
        let dispatcher_observer = observer.clone();
        let error_sink = sink.clone();
        let dispatcher = Dispatcher::spawn(
            bus.clone(),
            config.clone(),
            move |events| {
                for event in events {
                    handle_event_on(&dispatcher_inner, dispatcher_sink.as_ref(), &dispatcher_observer, event);
                }
            },
            move |err| error_sink.on_error(err),
        )?;

        Ok(Self { bus, config, inner, sink, observer, dispatcher: Mutex::new(Some(dispatcher)) })
    }

    /// Lets a [`crate::ConnectionManager`] built against
    /// [`DeviceManager::bus`] and [`DeviceManager::adapter_path`] observe
    /// `Connected` property changes, driving its auto-reconnect. Attach
    /// once, right after constructing both managers; a later call replaces
    /// any previously attached manager.
    pub fn attach_connection_manager(&self, connection_manager: Arc<crate::ConnectionManager>) {
        *self.observer.lock().expect("observer mutex poisoned") = Some(connection_manager);
    }

    /// The object path of the adapter this manager currently has selected,
    /// for building a sibling [`crate::ConnectionManager`] against the same
    /// adapter. `None` if no adapter was present at construction or the
    /// daemon has since removed it.
    pub fn adapter_path(&self) -> Option<String> {
        self.inner.lock().expect("device cache mutex poisoned").adapter_path.clone()
    }

    /// Returns the selected adapter's object path, or
    /// [`Error::Daemon`] if none is currently selected.
    fn require_adapter_path(&self) -> Result<String> {
        require_adapter_path(&self.inner)
    }

    /// Starts (or, if already scanning, no-ops) adapter discovery.
    ///
    /// If [`DeviceManagerConfig::filter_duplicates`] is set, installs a
    /// discovery filter suppressing repeat advertisements first. If
    /// [`DeviceManagerConfig::scan_duration_secs`] is nonzero, schedules an
    /// automatic `stop_discovery` after that many seconds.
    ///
    /// Fails with [`Error::Daemon`] if no adapter is currently selected.
    pub fn start_discovery(&self) -> Result<()> {
        if self.inner.lock().expect("device cache mutex poisoned").scanning {
            return Ok(());
        }
        let adapter_path = self.require_adapter_path()?;
        if self.config.filter_duplicates {
            self.bus.call::<(HashMap<&str, Variant<Box<dyn RefArg>>>,), ()>(
                &adapter_path,
                crate::ADAPTER_INTERFACE,
                "SetDiscoveryFilter",
                (discovery_filter_dict(),),
                self.config.adapter_call_timeout,
            )?;
        }
        self.bus.call::<(), ()>(
            &adapter_path,
            crate::ADAPTER_INTERFACE,
            "StartDiscovery",
            (),
            self.config.adapter_call_timeout,
        )?;
        let generation = {
            let mut guard = self.inner.lock().expect("device cache mutex poisoned");
            guard.scanning = true;
            guard.scan_generation = guard.scan_generation.wrapping_add(1);
            guard.scan_generation
        };
        self.sink.on_scan_status(true);
        if self.config.scan_duration_secs > 0 {
            self.spawn_scan_timer(generation, adapter_path);
        }
        Ok(())
    }

    /// Spawns a one-shot timer that stops discovery after
    /// `scan_duration_secs`, unless the scan it was bounding has already
    /// ended (by an explicit `stop_discovery` or a newer `start_discovery`,
    /// tracked via `generation`).
    fn spawn_scan_timer(&self, generation: u64, adapter_path: String) {
        let inner = self.inner.clone();
        let bus = self.bus.clone();
        let timeout = self.config.adapter_call_timeout;
        let sink = self.sink.clone();
        let duration = Duration::from_secs(self.config.scan_duration_secs);
        let spawned = std::thread::Builder::new().name("bluez-core-scan-timer".into()).spawn(move || {
            std::thread::sleep(duration);
            if !scan_timer_should_stop(&inner, generation) {
                return;
            }
            let _ = bus.call::<(), ()>(&adapter_path, crate::ADAPTER_INTERFACE, "StopDiscovery", (), timeout);
            sink.on_scan_status(false);
        });
        if let Err(err) = spawned {
            log::warn!("failed to start scan-duration timer: {err}");
        }
    }

    /// Stops discovery if running; a no-op otherwise.
    pub fn stop_discovery(&self) -> Result<()> {
        if !self.inner.lock().expect("device cache mutex poisoned").scanning {
            return Ok(());
        }
        let adapter_path = self.require_adapter_path()?;
        self.bus.call::<(), ()>(
            &adapter_path,
            crate::ADAPTER_INTERFACE,
            "StopDiscovery",
            (),
            self.config.adapter_call_timeout,
        )?;
        self.inner.lock().expect("device cache mutex poisoned").scanning = false;
        self.sink.on_scan_status(false);
        Ok(())
    }

    /// Snapshots every currently cached device.
    pub fn list_devices(&self) -> Vec<Device> {
        self.inner.lock().expect("device cache mutex poisoned").devices.values().cloned().collect()
    }

    /// Looks up a single cached device by address.
    pub fn get_device(&self, address: Address) -> Option<Device> {
        self.inner.lock().expect("device cache mutex poisoned").devices.get(&address).cloned()
    }

    /// Sets a device's alias, both on the daemon and in the cache.
    ///
    /// An empty `alias` is rejected with [`Error::InvalidArgument`] before
    /// any bus call — the alias-fallback invariant on [`Device`] means an
    /// explicit empty alias would otherwise silently become the name.
    pub fn set_alias(&self, address: Address, alias: &str) -> Result<()> {
        if alias.is_empty() {
            return Err(Error::InvalidArgument("alias must not be empty".into()));
        }
        let path = self.device_path(address)?;
        self.bus.call::<(&str, &str, Variant<Box<dyn RefArg>>), ()>(
            &path,
            crate::PROPERTIES_INTERFACE,
            "Set",
            (crate::DEVICE_INTERFACE, "Alias", Variant(Box::new(alias.to_string()) as Box<dyn RefArg>)),
            self.config.adapter_call_timeout,
        )?;
        let mut inner = self.inner.lock().expect("device cache mutex poisoned");
        if let Some(device) = inner.devices.get_mut(&address) {
            device.set_alias(alias.to_string());
        }
        Ok(())
    }

    /// Removes a device from the daemon's own cache (`Adapter1.RemoveDevice`)
    /// and, on success, from this cache.
    pub fn remove_device(&self, address: Address) -> Result<()> {
        let path = self.device_path(address)?;
        let adapter_path = self.require_adapter_path()?;
        let object_path =
            dbus::Path::new(path).map_err(|e| Error::InvalidArgument(format!("malformed device path: {e}")))?;
        self.bus.call::<(dbus::Path,), ()>(
            &adapter_path,
            crate::ADAPTER_INTERFACE,
            "RemoveDevice",
            (object_path,),
            self.config.adapter_call_timeout,
        )?;
        self.inner.lock().expect("device cache mutex poisoned").devices.remove(&address);
        Ok(())
    }

    /// Stops discovery (if running) and joins the Dispatcher thread.
    /// Safe to call more than once.
    pub fn destroy(&self) {
        let _ = self.stop_discovery();
        if let Some(mut dispatcher) = self.dispatcher.lock().expect("dispatcher mutex poisoned").take() {
            dispatcher.stop();
        }
    }

    /// Resolves a cached address to its current object path, falling back
    /// to the deterministic path derivation when the daemon's own listing
    /// does not (yet) include it.
    pub(crate) fn device_path(&self, address: Address) -> Result<String> {
        let objects = self.bus.managed_object_interfaces(self.config.adapter_call_timeout)?;
        if let Some((path, _)) = objects.iter().find(|(p, _)| crate::address::address_of(p) == Some(address)) {
            return Ok(path.clone());
        }
        let guard = self.inner.lock().expect("device cache mutex poisoned");
        if guard.devices.contains_key(&address) {
            let adapter_path = guard.adapter_path.clone().unwrap_or_default();
            return Ok(path_of(adapter_index_of(&adapter_path), address));
        }
        Err(Error::NoDevice(address.to_string()))
    }

    /// The shared bus session, for a [`crate::ConnectionManager`]
    /// constructed against the same daemon connection.
    pub fn bus(&self) -> Arc<BusClient> {
        self.bus.clone()
    }
}

/// Clones the currently selected adapter path out of `inner`, or fails
/// with [`Error::Daemon`] if none is selected — e.g. no adapter was found
/// at construction, or the daemon has since removed it. Factored out as a
/// free function so it is testable without constructing a [`DeviceManager`]
/// (which needs a live bus session).
fn require_adapter_path(inner: &Mutex<Inner>) -> Result<String> {
    inner
        .lock()
        .expect("device cache mutex poisoned")
        .adapter_path
        .clone()
        .ok_or_else(|| Error::daemon("NoAdapter", "no Bluetooth adapter is present"))
}

fn adapter_index_of(adapter_path: &str) -> u32 {
    adapter_path.rsplit("hci").next().and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// `Adapter1.SetDiscoveryFilter` payload asking the daemon not to repeat
/// advertisements for devices already seen this scan.
fn discovery_filter_dict() -> HashMap<&'static str, Variant<Box<dyn RefArg>>> {
    let mut dict: HashMap<&'static str, Variant<Box<dyn RefArg>>> = HashMap::new();
    dict.insert("DuplicateData", Variant(Box::new(false) as Box<dyn RefArg>));
    dict
}

/// Checks whether a scan-duration timer still applies to the scan it was
/// spawned for and, if so, marks it stopped. Returns `false` (and leaves
/// `scanning` untouched) if a `stop_discovery` or a newer `start_discovery`
/// already moved past the generation the timer was bounding.
fn scan_timer_should_stop(inner: &Mutex<Inner>, generation: u64) -> bool {
    let mut guard = inner.lock().expect("device cache mutex poisoned");
    if guard.scanning && guard.scan_generation == generation {
        guard.scanning = false;
        true
    } else {
        false
    }
}

fn handle_event_on(
    inner: &Mutex<Inner>,
    sink: &dyn DiscoverySink,
    observer: &Mutex<Option<Arc<dyn ConnectionObserver>>>,
    event: Event,
) {
    match event {
        Event::DeviceAdded { properties, .. } => {
            let Some(device) = Device::from_properties(&properties) else { return };
            let address = device.address();
            let mut guard = inner.lock().expect("device cache mutex poisoned");
            let is_new = !guard.devices.contains_key(&address);
            guard.devices.insert(address, device.clone());
            drop(guard);
            if is_new {
                sink.on_discovered(&device);
            }
        }
        Event::DevicePropertyChanged { path, changed } => {
            let Some(address) = crate::address::address_of(&path) else { return };
            let mut guard = inner.lock().expect("device cache mutex poisoned");
            let device = match guard.devices.get_mut(&address) {
                Some(device) => {
                    device.merge_properties(&changed);
                    device.clone()
                }
                None => {
                    // First observation of this device arrived as a
                    // property change rather than `InterfacesAdded`;
                    // synthesize an entry rather than dropping the data.
                    match Device::from_properties(&changed) {
                        Some(device) => {
                            guard.devices.insert(address, device.clone());
                            device
                        }
                        None => return,
                    }
                }
            };
            drop(guard);
            sink.on_discovered(&device);
            if let Some(obs) = observer.lock().expect("observer mutex poisoned").as_ref() {
                obs.on_property_changed(address, &changed);
            }
        }
        Event::DeviceRemoved { path } => {
            if let Some(address) = crate::address::address_of(&path) {
                inner.lock().expect("device cache mutex poisoned").devices.remove(&address);
            }
        }
        Event::AdapterRemoved { path } => {
            let mut guard = inner.lock().expect("device cache mutex poisoned");
            if guard.adapter_path.as_deref() == Some(path.as_str()) {
                guard.adapter_path = None;
                drop(guard);
                log::warn!("adapter {path} was removed; discovery will fail until a new adapter appears");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::property_map;
    use crate::properties::PropertyValue::*;

    struct RecordingSink(Mutex<Vec<Address>>);
    impl DiscoverySink for RecordingSink {
        fn on_discovered(&self, device: &Device) {
            self.0.lock().unwrap().push(device.address());
        }
    }

    fn fresh_inner() -> Mutex<Inner> {
        Mutex::new(Inner { devices: HashMap::new(), scanning: false, scan_generation: 0, adapter_path: None })
    }

    fn fresh_inner_with_adapter(path: &str) -> Mutex<Inner> {
        Mutex::new(Inner {
            devices: HashMap::new(),
            scanning: false,
            scan_generation: 0,
            adapter_path: Some(path.to_string()),
        })
    }

    fn no_observer() -> Mutex<Option<Arc<dyn ConnectionObserver>>> {
        Mutex::new(None)
    }

    #[test]
    fn device_added_fires_callback_once() {
        let inner = fresh_inner();
        let sink = RecordingSink(Mutex::new(Vec::new()));
        let observer = no_observer();
        let props = property_map(vec![("Address", Str("11:22:33:44:55:66".into()))]);
        let path = "/org/bluez/hci0/dev_11_22_33_44_55_66".to_string();
        handle_event_on(&inner, &sink, &observer, Event::DeviceAdded { path: path.clone(), properties: props.clone() });
        handle_event_on(&inner, &sink, &observer, Event::DeviceAdded { path, properties: props });
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        assert_eq!(inner.lock().unwrap().devices.len(), 1);
    }

    #[test]
    fn property_changed_on_unknown_device_synthesizes_entry() {
        let inner = fresh_inner();
        let sink = RecordingSink(Mutex::new(Vec::new()));
        let observer = no_observer();
        let changed = property_map(vec![("Address", Str("AA:BB:CC:DD:EE:FF".into())), ("RSSI", I8(-40))]);
        handle_event_on(
            &inner,
            &sink,
            &observer,
            Event::DevicePropertyChanged { path: "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF".into(), changed },
        );
        let addr: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(inner.lock().unwrap().devices.get(&addr).unwrap().rssi(), Some(-40));
    }

    #[test]
    fn device_removed_drops_from_cache() {
        let inner = fresh_inner();
        let sink = RecordingSink(Mutex::new(Vec::new()));
        let observer = no_observer();
        let props = property_map(vec![("Address", Str("11:22:33:44:55:66".into()))]);
        let path = "/org/bluez/hci0/dev_11_22_33_44_55_66".to_string();
        handle_event_on(&inner, &sink, &observer, Event::DeviceAdded { path: path.clone(), properties: props });
        handle_event_on(&inner, &sink, &observer, Event::DeviceRemoved { path });
        assert!(inner.lock().unwrap().devices.is_empty());
    }

    #[test]
    fn adapter_removed_clears_adapter_handle_but_not_devices() {
        let inner = fresh_inner_with_adapter("/org/bluez/hci0");
        let sink = RecordingSink(Mutex::new(Vec::new()));
        let observer = no_observer();
        let props = property_map(vec![("Address", Str("11:22:33:44:55:66".into()))]);
        handle_event_on(
            &inner,
            &sink,
            &observer,
            Event::DeviceAdded { path: "/org/bluez/hci0/dev_11_22_33_44_55_66".into(), properties: props },
        );
        handle_event_on(&inner, &sink, &observer, Event::AdapterRemoved { path: "/org/bluez/hci0".into() });
        let guard = inner.lock().unwrap();
        assert_eq!(guard.adapter_path, None);
        assert_eq!(guard.devices.len(), 1, "an unrelated adapter event must not evict cached devices");
    }

    #[test]
    fn adapter_removed_ignores_unrelated_adapter_path() {
        let inner = fresh_inner_with_adapter("/org/bluez/hci0");
        let sink = RecordingSink(Mutex::new(Vec::new()));
        let observer = no_observer();
        handle_event_on(&inner, &sink, &observer, Event::AdapterRemoved { path: "/org/bluez/hci1".into() });
        assert_eq!(inner.lock().unwrap().adapter_path.as_deref(), Some("/org/bluez/hci0"));
    }

    #[test]
    fn property_changed_notifies_attached_observer() {
        struct RecordingObserver(Mutex<Vec<(Address, bool)>>);
        impl ConnectionObserver for RecordingObserver {
            fn on_property_changed(&self, address: Address, changed: &PropertyMap) {
                if let Some(connected) = changed.get("Connected").and_then(|v| v.as_bool()) {
                    self.0.lock().unwrap().push((address, connected));
                }
            }
        }

        let inner = fresh_inner();
        let sink = RecordingSink(Mutex::new(Vec::new()));
        let recorded: Arc<RecordingObserver> = Arc::new(RecordingObserver(Mutex::new(Vec::new())));
        let observer: Mutex<Option<Arc<dyn ConnectionObserver>>> = Mutex::new(Some(recorded.clone()));
        let addr: Address = "11:22:33:44:55:66".parse().unwrap();
        handle_event_on(
            &inner,
            &sink,
            &observer,
            Event::DeviceAdded {
                path: "/org/bluez/hci0/dev_11_22_33_44_55_66".into(),
                properties: property_map(vec![("Address", Str(addr.to_string()))]),
            },
        );
        handle_event_on(
            &inner,
            &sink,
            &observer,
            Event::DevicePropertyChanged {
                path: "/org/bluez/hci0/dev_11_22_33_44_55_66".into(),
                changed: property_map(vec![("Connected", Bool(false))]),
            },
        );
        assert_eq!(recorded.0.lock().unwrap().as_slice(), &[(addr, false)]);
    }

    #[test]
    fn adapter_index_of_parses_trailing_digits() {
        assert_eq!(adapter_index_of("/org/bluez/hci1"), 1);
        assert_eq!(adapter_index_of("/org/bluez/hci0"), 0);
    }

    #[test]
    fn discovery_filter_dict_has_duplicate_data_key() {
        assert!(discovery_filter_dict().contains_key("DuplicateData"));
    }

    #[test]
    fn scan_timer_ignores_stale_generation() {
        let inner = fresh_inner();
        inner.lock().unwrap().scanning = true;
        inner.lock().unwrap().scan_generation = 2;
        assert!(!scan_timer_should_stop(&inner, 1), "a timer from an earlier scan must not stop a newer one");
        assert!(inner.lock().unwrap().scanning);
    }

    #[test]
    fn scan_timer_stops_matching_generation() {
        let inner = fresh_inner();
        inner.lock().unwrap().scanning = true;
        inner.lock().unwrap().scan_generation = 5;
        assert!(scan_timer_should_stop(&inner, 5));
        assert!(!inner.lock().unwrap().scanning);
    }

    #[test]
    fn scan_timer_is_noop_once_already_stopped() {
        let inner = fresh_inner();
        inner.lock().unwrap().scan_generation = 5;
        assert!(!scan_timer_should_stop(&inner, 5));
    }

    #[test]
    fn require_adapter_path_fails_without_an_adapter() {
        let inner = fresh_inner();
        assert!(matches!(require_adapter_path(&inner), Err(Error::Daemon { .. })));
    }

    #[test]
    fn require_adapter_path_succeeds_once_one_is_selected() {
        let inner = fresh_inner_with_adapter("/org/bluez/hci0");
        assert_eq!(require_adapter_path(&inner).unwrap(), "/org/bluez/hci0");
    }
}
