//! Connection, pairing, and trust operations against a device's object path.

use crate::address::Address;
use crate::bus::{resolve_device_path, BusClient};
use crate::callbacks::ConnectionSink;
use crate::config::{ConnectionManagerConfig, ConnectionState};
use crate::device_manager::ConnectionObserver;
use crate::properties::PropertyMap;
use crate::{Error, Result};
use dbus::arg::{RefArg, Variant};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct NoopSink;
impl ConnectionSink for NoopSink {}

/// State shared between a [`ConnectionManager`] handle and the detached
/// reconnect thread it may spawn; kept in its own `Arc` so the thread can
/// run the same bus-call logic as the public API without holding a
/// reference back to the manager itself.
struct Shared {
    bus: Arc<BusClient>,
    adapter_path: String,
    config: ConnectionManagerConfig,
    states: Mutex<HashMap<Address, ConnectionState>>,
    sink: Arc<dyn ConnectionSink>,
}

/// Tracks a small per-device connection state machine and issues the
/// `Connect`/`Disconnect`/`Pair`/`Trust`/`Block`/`Unpair` operations behind
/// it.
///
/// Shares a [`BusClient`] with a [`crate::DeviceManager`] — construct one
/// from [`crate::DeviceManager::bus`] and
/// [`crate::DeviceManager::adapter_path`] so both managers see every
/// signal exactly once and neither installs its own competing match
/// rules. Attach it back with
/// [`crate::DeviceManager::attach_connection_manager`] so its
/// auto-reconnect can observe `Connected` property changes.
///
/// Cheap to clone: every clone shares the same connection-state cache.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Builds a manager against `adapter_path` (the same adapter a sibling
    /// [`crate::DeviceManager`] selected) using a shared bus session.
    pub fn new(
        bus: Arc<BusClient>,
        adapter_path: impl Into<String>,
        config: ConnectionManagerConfig,
        sink: Option<Arc<dyn ConnectionSink>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                adapter_path: adapter_path.into(),
                config,
                states: Mutex::new(HashMap::new()),
                sink: sink.unwrap_or_else(|| Arc::new(NoopSink)),
            }),
        }
    }

    /// The last known state for `address`, or [`ConnectionState::Disconnected`]
    /// if nothing has been attempted yet.
    pub fn get_state(&self, address: Address) -> ConnectionState {
        self.shared.states.lock().expect("connection state mutex poisoned").get(&address).copied().unwrap_or(ConnectionState::Disconnected)
    }

    /// Issues `Device1.Connect`. Publishes [`ConnectionState::Connecting`]
    /// before the bus call and settles into [`ConnectionState::Connected`]
    /// or [`ConnectionState::Failed`] after it returns — no transition is
    /// skipped even if the call fails immediately.
    pub fn connect(&self, address: Address) -> Result<()> {
        connect_with(&self.shared, address)
    }

    /// Issues `Device1.Disconnect`. This is a user-initiated disconnect and
    /// never triggers auto-reconnect.
    pub fn disconnect(&self, address: Address) -> Result<()> {
        let timeout = self.shared.config.disconnect_timeout;
        run_transition(&self.shared, address, ConnectionState::Disconnecting, timeout, "Disconnect")
    }

    /// Issues `Device1.Pair`. On success, if
    /// [`ConnectionManagerConfig::trust_on_pair`] is set, also writes
    /// `Trusted=true`; a failure to set trust does not undo the pairing —
    /// `pair()` still returns `Ok` — and is only logged, since there is no
    /// sink callback for a trust write that was never requested directly.
    pub fn pair(&self, address: Address) -> Result<()> {
        let path = resolve_path(&self.shared, address)?;
        let result = self
            .shared
            .bus
            .call::<(), ()>(&path, crate::DEVICE_INTERFACE, "Pair", (), self.shared.config.pair_timeout)
            .map_err(|e| match e {
                Error::Bus(inner) => Error::PairingFailed(inner.to_string()),
                Error::Daemon { name, message } => Error::PairingFailed(format!("{name}: {message}")),
                other => other,
            });
        if result.is_ok() && self.shared.config.trust_on_pair {
            if let Err(err) = set_trusted(&self.shared, address, true) {
                log::warn!("paired with {address} but failed to set Trusted=true: {err}");
            }
        }
        self.shared.sink.on_pairing_result(address, &result);
        result
    }

    /// Removes pairing by asking the adapter to forget the device
    /// entirely (`Adapter1.RemoveDevice`); BlueZ has no narrower
    /// unpair-without-forgetting primitive.
    pub fn unpair(&self, address: Address) -> Result<()> {
        let path = resolve_path(&self.shared, address)?;
        let object_path =
            dbus::Path::new(path).map_err(|e| Error::InvalidArgument(format!("malformed device path: {e}")))?;
        self.shared.bus.call::<(dbus::Path,), ()>(
            &self.shared.adapter_path,
            crate::ADAPTER_INTERFACE,
            "RemoveDevice",
            (object_path,),
            self.shared.config.property_call_timeout,
        )
    }

    /// Writes `Device1.Trusted`.
    pub fn trust(&self, address: Address, trusted: bool) -> Result<()> {
        set_trusted(&self.shared, address, trusted)
    }

    /// Writes `Device1.Blocked`.
    pub fn block(&self, address: Address, blocked: bool) -> Result<()> {
        let path = resolve_path(&self.shared, address)?;
        set_property(&self.shared, &path, "Blocked", blocked)
    }
}

impl ConnectionObserver for ConnectionManager {
    /// Drives auto-reconnect: if the daemon reports `Connected: false` for
    /// a device this manager currently believes is
    /// [`ConnectionState::Connected`], and
    /// [`ConnectionManagerConfig::auto_reconnect`] is set, fires exactly
    /// one reconnect attempt on a detached thread (this callback runs on
    /// the Dispatcher thread and must not block on a bus round-trip
    /// itself). A disconnect this manager itself requested already moves
    /// the cached state off `Connected` before the daemon's own signal
    /// arrives, so no separate "was this us" bookkeeping is needed — see
    /// `should_auto_reconnect` for the exact check.
    fn on_property_changed(&self, address: Address, changed: &PropertyMap) {
        if !should_auto_reconnect(changed, self.get_state(address), self.shared.config.auto_reconnect) {
            return;
        }
        let shared = self.shared.clone();
        if let Err(err) = std::thread::Builder::new().name("bluez-core-reconnect".into()).spawn(move || {
            let _ = connect_with(&shared, address);
        }) {
            log::warn!("failed to spawn auto-reconnect thread for {address}: {err}");
        }
    }
}

/// Pure decision logic behind [`ConnectionManager::on_property_changed`],
/// factored out so it is testable without a live bus or a background
/// thread.
fn should_auto_reconnect(changed: &PropertyMap, current_state: ConnectionState, auto_reconnect_enabled: bool) -> bool {
    if !auto_reconnect_enabled {
        return false;
    }
    if current_state != ConnectionState::Connected {
        return false;
    }
    matches!(changed.get("Connected").and_then(|v| v.as_bool()), Some(false))
}

fn set_trusted(shared: &Shared, address: Address, trusted: bool) -> Result<()> {
    let path = resolve_path(shared, address)?;
    set_property(shared, &path, "Trusted", trusted)
}

fn set_property(shared: &Shared, path: &str, name: &str, value: bool) -> Result<()> {
    shared.bus.call::<(&str, &str, Variant<Box<dyn RefArg>>), ()>(
        path,
        crate::PROPERTIES_INTERFACE,
        "Set",
        (crate::DEVICE_INTERFACE, name, Variant(Box::new(value) as Box<dyn RefArg>)),
        shared.config.property_call_timeout,
    )
}

fn resolve_path(shared: &Shared, address: Address) -> Result<String> {
    resolve_device_path(&shared.bus, &shared.adapter_path, address, shared.config.property_call_timeout)
}

/// Shared `Connect` implementation: used by the public `connect()` call
/// and, identically, by the detached auto-reconnect thread.
fn connect_with(shared: &Shared, address: Address) -> Result<()> {
    let timeout = shared.config.connect_timeout;
    run_transition(shared, address, ConnectionState::Connecting, timeout, "Connect")
}

/// Publishes the in-flight state, issues `member` with no arguments, then
/// publishes the terminal state. Used by `connect` (and auto-reconnect)
/// and `disconnect`, which share this exact shape and differ only in
/// which BlueZ method runs and which states bracket it.
fn run_transition(
    shared: &Shared,
    address: Address,
    in_flight: ConnectionState,
    timeout: Duration,
    member: &'static str,
) -> Result<()> {
    let path = resolve_path(shared, address)?;
    publish_state(&shared.states, shared.sink.as_ref(), address, in_flight);
    let result = shared.bus.call::<(), ()>(&path, crate::DEVICE_INTERFACE, member, (), timeout);
    let terminal = match &result {
        Ok(()) if member == "Disconnect" => ConnectionState::Disconnected,
        Ok(()) => ConnectionState::Connected,
        Err(_) => ConnectionState::Failed,
    };
    publish_state(&shared.states, shared.sink.as_ref(), address, terminal);
    result.map_err(|e| match e {
        Error::Bus(inner) => Error::ConnectionFailed(inner.to_string()),
        Error::Daemon { name, message } => Error::ConnectionFailed(format!("{name}: {message}")),
        other => other,
    })
}

/// Records a connection-state transition and notifies the sink. Takes only
/// the state map and sink rather than the whole [`Shared`] so it is
/// callable from a test without a live bus session.
fn publish_state(
    states: &Mutex<HashMap<Address, ConnectionState>>,
    sink: &dyn ConnectionSink,
    address: Address,
    state: ConnectionState,
) {
    states.lock().expect("connection state mutex poisoned").insert(address, state);
    sink.on_state_changed(address, state);
}
