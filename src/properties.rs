//! Shared property-dictionary decoding.
//!
//! `InterfacesAdded` and `PropertiesChanged` both deliver a `a{sv}`
//! dictionary of BlueZ properties; this module is the one place that
//! variant is unwrapped, so the two ingest paths in
//! [`crate::device_manager`] can never drift out of sync with each other.
//!
//! `Connected` is decoded here too, even though [`crate::Device`] has no
//! field for it, because [`crate::ConnectionManager`]'s auto-reconnect
//! (§4.E) needs to observe the daemon's own connected/disconnected signal
//! rather than re-deriving it from the manager's own call history.

use dbus::arg::{self, RefArg, Variant};
use std::collections::HashMap;

/// A scalar value narrowed from a D-Bus variant, for the handful of keys
/// this crate understands (`Address`, `Name`, `Alias`, `Class`, `Paired`,
/// `Trusted`, `Blocked`, `RSSI`, `Connected`).
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// A UTF-8 string property (`Address`, `Name`, `Alias`).
    Str(String),
    /// An unsigned 32-bit integer property (`Class`).
    U32(u32),
    /// A signed 8-bit integer property (`RSSI`), after saturating clamp.
    I8(i8),
    /// A boolean property (`Paired`, `Trusted`, `Blocked`).
    Bool(bool),
}

impl PropertyValue {
    /// Narrows to `&str` if this is a [`PropertyValue::Str`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Narrows to `u32` if this is a [`PropertyValue::U32`].
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            PropertyValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    /// Narrows to `i8` if this is a [`PropertyValue::I8`].
    pub fn as_i8(&self) -> Option<i8> {
        match self {
            PropertyValue::I8(v) => Some(*v),
            _ => None,
        }
    }

    /// Narrows to `bool` if this is a [`PropertyValue::Bool`].
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// A decoded `a{sv}` property dictionary, keyed by property name.
pub type PropertyMap = HashMap<String, PropertyValue>;

/// Decodes a raw D-Bus property dictionary into a [`PropertyMap`],
/// dropping keys this crate does not understand (forward compatibility
/// with newer daemons) and values whose underlying type we cannot narrow.
///
/// Always recurses into the variant before reading the scalar — BlueZ is
/// free to send `RSSI` as `n` (int16) even though the narrower `y`/`n`
/// distinction does not matter to callers, and a parser that sometimes
/// reads the outer iterator directly misses that case.
pub fn decode_property_map<'a>(raw: impl IntoIterator<Item = (&'a String, &'a Variant<Box<dyn RefArg>>)>) -> PropertyMap {
    let mut out = PropertyMap::new();
    for (key, variant) in raw {
        let value = &variant.0;
        let decoded = match key.as_str() {
            "Address" | "Name" | "Alias" => value.as_str().map(|s| PropertyValue::Str(s.to_string())),
            "Class" => value.as_u64().map(|v| PropertyValue::U32(v as u32)),
            "RSSI" => value.as_i64().map(|v| PropertyValue::I8(saturating_i8(v))),
            "Paired" | "Trusted" | "Blocked" | "Connected" => arg::cast::<bool>(value).map(|v| PropertyValue::Bool(*v)),
            _ => None,
        };
        if let Some(decoded) = decoded {
            out.insert(key.clone(), decoded);
        }
    }
    out
}

/// Clamps a wire integer (which may arrive as `i16`, `i32`, or `i64`
/// depending on daemon version) into `i8` range instead of wrapping.
fn saturating_i8(v: i64) -> i8 {
    v.clamp(i8::MIN as i64, i8::MAX as i64) as i8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: Vec<(&str, PropertyValue)>) -> PropertyMap {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn saturating_clamp_on_oversized_rssi() {
        assert_eq!(saturating_i8(-200), i8::MIN);
        assert_eq!(saturating_i8(200), i8::MAX);
        assert_eq!(saturating_i8(-42), -42);
    }

    #[test]
    fn property_value_narrowing_round_trips() {
        let m = map(vec![
            ("Name", PropertyValue::Str("Foo".into())),
            ("Class", PropertyValue::U32(0x240404)),
            ("RSSI", PropertyValue::I8(-42)),
            ("Paired", PropertyValue::Bool(true)),
        ]);
        assert_eq!(m["Name"].as_str(), Some("Foo"));
        assert_eq!(m["Class"].as_u32(), Some(0x240404));
        assert_eq!(m["RSSI"].as_i8(), Some(-42));
        assert_eq!(m["Paired"].as_bool(), Some(true));
        assert_eq!(m["Name"].as_u32(), None);
    }
}
