//! Tagged bus events.
//!
//! The Dispatcher's only job is turning a matched `Message` into one of
//! these. No cache mutation happens here — that keeps the event shape
//! testable with a synthetic `Vec<Event>` and no live bus.

use crate::properties::{decode_property_map, PropertyMap};
use dbus::blocking::stdintf::org_freedesktop_dbus::{
    ObjectManagerInterfacesAdded, ObjectManagerInterfacesRemoved, PropertiesPropertiesChanged,
};

/// A bus occurrence relevant to device tracking, already parsed out of its
/// wire representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A new object exporting `org.bluez.Device1` appeared at `path`.
    DeviceAdded { path: String, properties: PropertyMap },
    /// A subset of `org.bluez.Device1` properties changed at `path`.
    DevicePropertyChanged { path: String, changed: PropertyMap },
    /// The object at `path` no longer exports `org.bluez.Device1`.
    DeviceRemoved { path: String },
    /// The object at `path` no longer exports `org.bluez.Adapter1`.
    AdapterRemoved { path: String },
}

/// Parses an `InterfacesAdded` signal, keeping only the `Device1` payload.
///
/// If the interfaces dictionary does not include the device interface,
/// there is no event; if it does but `Address` is absent from its
/// properties, [`Device::from_properties`](crate::Device) will later
/// discard it — this layer does not need to know that rule, it just
/// forwards whatever properties were attached to `Device1`.
pub(crate) fn from_interfaces_added(signal: ObjectManagerInterfacesAdded) -> Option<Event> {
    let path = signal.object.to_string();
    let device_props = signal.interfaces.get(crate::DEVICE_INTERFACE)?;
    Some(Event::DeviceAdded { path, properties: decode_property_map(device_props.iter().map(|(k, v)| (k, v))) })
}

/// Parses an `InterfacesRemoved` signal into a device- or adapter-removal
/// event, or `None` if neither interface is named.
pub(crate) fn from_interfaces_removed(signal: ObjectManagerInterfacesRemoved) -> Option<Event> {
    let path = signal.object.to_string();
    if signal.interfaces.iter().any(|i| i == crate::DEVICE_INTERFACE) {
        Some(Event::DeviceRemoved { path })
    } else if signal.interfaces.iter().any(|i| i == crate::ADAPTER_INTERFACE) {
        Some(Event::AdapterRemoved { path })
    } else {
        None
    }
}

/// Parses a `PropertiesChanged` signal for the device interface.
///
/// `path` must already have been confirmed to parse as a device path by
/// the caller: explicit path-prefix filtering instead of relying solely
/// on the `arg0='org.bluez.Device1'` match-rule argument, which can also
/// admit unrelated signals that happen to carry that string as their
/// first argument.
pub(crate) fn from_properties_changed(path: String, signal: PropertiesPropertiesChanged) -> Option<Event> {
    if signal.interface_name != crate::DEVICE_INTERFACE {
        return None;
    }
    let changed = decode_property_map(signal.changed_properties.iter().map(|(k, v)| (k, v)));
    Some(Event::DevicePropertyChanged { path, changed })
}

#[cfg(test)]
pub(crate) fn property_map(pairs: Vec<(&str, crate::properties::PropertyValue)>) -> PropertyMap {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
