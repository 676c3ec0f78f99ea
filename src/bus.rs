//! The Bus Client: one shared system-bus session.

use crate::address::address_of;
use crate::event::{from_interfaces_added, from_interfaces_removed, from_properties_changed, Event};
use crate::{Error, Result, ADAPTER_INTERFACE, DEVICE_INTERFACE, OBJECT_MANAGER_INTERFACE, SERVICE_NAME};
use dbus::arg::{AppendAll, ReadAll};
use dbus::blocking::stdintf::org_freedesktop_dbus::{
    ObjectManager, ObjectManagerInterfacesAdded, ObjectManagerInterfacesRemoved, PropertiesPropertiesChanged,
};
use dbus::blocking::Connection;
use dbus::message::MatchRule;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

/// Well-known name this crate attempts (but does not require) to own.
/// Clients that only consume BlueZ's API do not need a name of their own.
const WELL_KNOWN_NAME: &str = "io.crates.bluez_core";

/// A single system-bus session shared by [`crate::DeviceManager`] and
/// [`crate::ConnectionManager`].
///
/// Wraps a `dbus::blocking::Connection` behind a mutex: public-API callers
/// and the Dispatcher thread both drive the same connection, and the
/// underlying D-Bus library is not safe to call into concurrently. The
/// lock is held only for the span of one method call or one `process`
/// tick, never across a whole discovery session.
pub struct BusClient {
    connection: Mutex<Connection>,
    events_rx: Mutex<mpsc::Receiver<Event>>,
}

impl BusClient {
    /// Opens a new session against the system bus, attempts to acquire a
    /// well-known name (non-fatal on failure), and installs the two match
    /// rules this crate requires.
    ///
    /// Fails with [`Error::Bus`] if the session itself cannot be
    /// established; there is no partial state to clean up in that case.
    pub fn new() -> Result<Self> {
        let connection = Connection::new_system()?;

        if let Err(err) = connection.request_name(WELL_KNOWN_NAME, false, false, true) {
            log::warn!("could not acquire well-known name {WELL_KNOWN_NAME}: {err}; continuing without it");
        }

        let (tx, events_rx) = mpsc::channel();

        let added_tx = tx.clone();
        let added_rule = MatchRule::new_signal(OBJECT_MANAGER_INTERFACE, "InterfacesAdded");
        connection
            .add_match(added_rule, move |signal: ObjectManagerInterfacesAdded, _, _| {
                if let Some(event) = from_interfaces_added(signal) {
                    let _ = added_tx.send(event);
                }
                true
            })
            .map_err(|e| Error::Ipc(format!("failed to install InterfacesAdded match rule: {e}")))?;

        let removed_tx = tx.clone();
        let removed_rule = MatchRule::new_signal(OBJECT_MANAGER_INTERFACE, "InterfacesRemoved");
        connection
            .add_match(removed_rule, move |signal: ObjectManagerInterfacesRemoved, _, _| {
                if let Some(event) = from_interfaces_removed(signal) {
                    let _ = removed_tx.send(event);
                }
                true
            })
            .map_err(|e| Error::Ipc(format!("failed to install InterfacesRemoved match rule: {e}")))?;

        let changed_tx = tx;
        let changed_rule = MatchRule::new_signal("org.freedesktop.DBus.Properties", "PropertiesChanged");
        connection
            .add_match(changed_rule, move |signal: PropertiesPropertiesChanged, _, msg| {
                // The signal's own `interface_name` plus an explicit
                // path-prefix check replace a coarse `arg0=` match-rule
                // filter, which can admit unrelated signals whose first
                // argument happens to equal "org.bluez.Device1".
                if signal.interface_name != DEVICE_INTERFACE {
                    return true;
                }
                let Some(path) = msg.path() else { return true };
                let path = path.to_string();
                if address_of(&path).is_none() {
                    log::trace!("dropping PropertiesChanged for non-device path {path}");
                    return true;
                }
                if let Some(event) = from_properties_changed(path, signal) {
                    let _ = changed_tx.send(event);
                }
                true
            })
            .map_err(|e| Error::Ipc(format!("failed to install PropertiesChanged match rule: {e}")))?;

        Ok(Self { connection: Mutex::new(connection), events_rx: Mutex::new(events_rx) })
    }

    /// Issues a blocking method call and waits up to `timeout` for a reply.
    ///
    /// A daemon error reply becomes [`Error::Daemon`] (carrying the
    /// `org.bluez.Error.*` name and message); a transport-level failure
    /// becomes [`Error::Bus`].
    pub(crate) fn call<A, R>(&self, path: &str, interface: &str, member: &str, args: A, timeout: Duration) -> Result<R>
    where
        A: AppendAll,
        R: ReadAll,
    {
        let connection = self.connection.lock().expect("bus connection mutex poisoned");
        let proxy = connection.with_proxy(SERVICE_NAME, path, timeout);
        proxy.method_call(interface, member, args).map_err(classify)
    }

    /// Returns `(object_path, interface_names)` for every object the
    /// daemon currently manages. Used once at startup for adapter
    /// selection, and on every connection-manager operation for device
    /// path resolution.
    pub(crate) fn managed_object_interfaces(&self, timeout: Duration) -> Result<Vec<(String, Vec<String>)>> {
        let connection = self.connection.lock().expect("bus connection mutex poisoned");
        let proxy = connection.with_proxy(SERVICE_NAME, "/", timeout);
        let objects = proxy.get_managed_objects().map_err(classify)?;
        Ok(objects.into_iter().map(|(path, ifaces)| (path.to_string(), ifaces.into_keys().collect())).collect())
    }

    /// Drains incoming messages for up to `max_wait`, returning the number
    /// of `process` ticks that actually dispatched a message. Never blocks
    /// past `max_wait` even if messages keep arriving.
    pub(crate) fn pump(&self, max_wait: Duration) -> Result<usize> {
        let connection = self.connection.lock().expect("bus connection mutex poisoned");
        let deadline = std::time::Instant::now() + max_wait;
        let mut drained = 0;
        loop {
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            match connection.process(Duration::from_millis(0)) {
                Ok(true) => drained += 1,
                Ok(false) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(drained)
    }

    /// Pulls up to `max` events the match-rule callbacks have queued since
    /// the last call, without blocking. Any remainder stays queued for the
    /// next call — this is what lets the Dispatcher bound how much work one
    /// tick does without losing events.
    pub(crate) fn drain_events(&self, max: usize) -> Vec<Event> {
        let rx = self.events_rx.lock().expect("events channel mutex poisoned");
        let mut out = Vec::new();
        while out.len() < max {
            match rx.try_recv() {
                Ok(event) => out.push(event),
                Err(_) => break,
            }
        }
        out
    }
}

/// Finds the first managed object exporting `org.bluez.Adapter1`, in the
/// order the daemon returned them. Does not poll.
pub(crate) fn select_adapter(objects: &[(String, Vec<String>)]) -> Option<String> {
    objects.iter().find(|(_, ifaces)| ifaces.iter().any(|i| i == ADAPTER_INTERFACE)).map(|(path, _)| path.clone())
}

/// Resolves `address` to the object path BlueZ currently exports for it,
/// by scanning the live managed-object listing. Falls back to the
/// deterministic path derivation under `adapter_path` if the daemon has
/// not (yet) surfaced the device — e.g. a `Connect` issued immediately
/// after a `DeviceAdded` signal, before the object tree settles.
pub(crate) fn resolve_device_path(bus: &BusClient, adapter_path: &str, address: crate::Address, timeout: Duration) -> Result<String> {
    let objects = bus.managed_object_interfaces(timeout)?;
    if let Some((path, _)) = objects.iter().find(|(p, ifaces)| {
        ifaces.iter().any(|i| i == DEVICE_INTERFACE) && address_of(p) == Some(address)
    }) {
        return Ok(path.clone());
    }
    let index = adapter_path.rsplit("hci").next().and_then(|s| s.parse().ok()).unwrap_or(0);
    Ok(crate::address::path_of(index, address))
}

fn classify(err: dbus::Error) -> Error {
    match err.name() {
        Some(name) => Error::daemon(name, err.message().unwrap_or_default()),
        None => Error::Bus(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_adapter_picks_first_match_in_order() {
        let objects = vec![
            ("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF".to_string(), vec![DEVICE_INTERFACE.to_string()]),
            ("/org/bluez/hci0".to_string(), vec![ADAPTER_INTERFACE.to_string()]),
            ("/org/bluez/hci1".to_string(), vec![ADAPTER_INTERFACE.to_string()]),
        ];
        assert_eq!(select_adapter(&objects), Some("/org/bluez/hci0".to_string()));
    }

    #[test]
    fn select_adapter_returns_none_when_absent() {
        let objects = vec![("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF".to_string(), vec![DEVICE_INTERFACE.to_string()])];
        assert_eq!(select_adapter(&objects), None);
    }
}
