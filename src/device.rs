//! The typed device record and its class-of-device decoder.

use crate::address::Address;
use crate::properties::PropertyMap;
use std::str::FromStr;

/// A semantic classification of a remote device, derived purely from its
/// class-of-device bits. Re-deriving a device's kind from its stored
/// `class` always reproduces the stored kind.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, strum::Display)]
pub enum DeviceKind {
    /// Class did not match any recognized major class.
    Unknown,
    /// Major class `0x01` (Computer).
    Computer,
    /// Major class `0x02` (Phone).
    Phone,
    /// Major class `0x04` (Audio/Video), output-side or unrecognized minor class.
    AudioSink,
    /// Major class `0x04` (Audio/Video), minor class `0x03` (microphone).
    AudioSource,
    /// Major class `0x05` (Peripheral), minor class `0x01` or `0x03` (keyboard, combo).
    Keyboard,
    /// Major class `0x05` (Peripheral), minor class `0x02` (mouse).
    Mouse,
    /// Major class `0x05` (Peripheral), any other minor class.
    Input,
}

/// Classifies a 24-bit class-of-device integer.
///
/// Only bits 2–12 (minor and major class) affect the result; the service
/// class bits (13–23) and format bits (0–1) are ignored.
pub fn kind_from_class(class: u32) -> DeviceKind {
    let major = (class >> 8) & 0x1F;
    let minor = (class >> 2) & 0x3F;
    match major {
        0x01 => DeviceKind::Computer,
        0x02 => DeviceKind::Phone,
        0x04 => match minor {
            0x03 => DeviceKind::AudioSource,
            _ => DeviceKind::AudioSink,
        },
        0x05 => match minor {
            0x01 | 0x03 => DeviceKind::Keyboard,
            0x02 => DeviceKind::Mouse,
            _ => DeviceKind::Input,
        },
        _ => DeviceKind::Unknown,
    }
}

/// A remote Bluetooth device, as cached by [`crate::DeviceManager`].
///
/// Keyed by [`Device::address`] in the cache; mutated only by the
/// Dispatcher (signal ingest) and by explicit alias/trust/block writes
/// through the public API.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    address: Address,
    name: String,
    alias: String,
    kind: DeviceKind,
    rssi: Option<i8>,
    paired: bool,
    trusted: bool,
    blocked: bool,
    class: u32,
}

impl Device {
    /// Builds a `Device` from a decoded property dictionary, applying the
    /// alias fallback chain (`alias` else `name` else `address`).
    ///
    /// Returns `None` if `Address` is absent — a missing address in an
    /// otherwise-valid entry yields no device.
    pub(crate) fn from_properties(props: &PropertyMap) -> Option<Self> {
        let address = Address::from_str(props.get("Address")?.as_str()?).ok()?;
        let name = props.get("Name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let class = props.get("Class").and_then(|v| v.as_u32()).unwrap_or(0);
        let mut device = Self {
            address,
            alias: String::new(),
            name,
            kind: kind_from_class(class),
            rssi: props.get("RSSI").and_then(|v| v.as_i8()),
            paired: props.get("Paired").and_then(|v| v.as_bool()).unwrap_or(false),
            trusted: props.get("Trusted").and_then(|v| v.as_bool()).unwrap_or(false),
            blocked: props.get("Blocked").and_then(|v| v.as_bool()).unwrap_or(false),
            class,
        };
        device.alias = props.get("Alias").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        device.apply_alias_fallback();
        Some(device)
    }

    /// Merges a presented subset of properties into `self` in place,
    /// field-by-field — unlisted fields are preserved.
    pub(crate) fn merge_properties(&mut self, props: &PropertyMap) {
        if let Some(name) = props.get("Name").and_then(|v| v.as_str()) {
            self.name = name.to_string();
        }
        if let Some(alias) = props.get("Alias").and_then(|v| v.as_str()) {
            self.alias = alias.to_string();
        }
        if let Some(class) = props.get("Class").and_then(|v| v.as_u32()) {
            self.class = class;
            self.kind = kind_from_class(class);
        }
        if let Some(rssi) = props.get("RSSI").and_then(|v| v.as_i8()) {
            self.rssi = Some(rssi);
        }
        if let Some(paired) = props.get("Paired").and_then(|v| v.as_bool()) {
            self.paired = paired;
        }
        if let Some(trusted) = props.get("Trusted").and_then(|v| v.as_bool()) {
            self.trusted = trusted;
        }
        if let Some(blocked) = props.get("Blocked").and_then(|v| v.as_bool()) {
            self.blocked = blocked;
        }
        self.apply_alias_fallback();
    }

    /// Invariant 2: alias is never empty after ingest.
    fn apply_alias_fallback(&mut self) {
        if self.alias.is_empty() {
            self.alias = if !self.name.is_empty() { self.name.clone() } else { self.address.to_string() };
        }
    }

    /// The canonical address — always equal to the cache's lookup key.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The daemon-reported name. May be empty if the daemon has not yet
    /// resolved it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The user-facing alias. Never empty: falls back to [`Device::name`],
    /// then to [`Device::address`].
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Sets the alias in place. Used by [`crate::DeviceManager::set_alias`];
    /// an empty string is rejected by the caller before reaching here.
    pub(crate) fn set_alias(&mut self, alias: String) {
        self.alias = alias;
        self.apply_alias_fallback();
    }

    /// The semantic device kind, derived from [`Device::class`].
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Last-seen signal strength in dBm, if ever reported.
    pub fn rssi(&self) -> Option<i8> {
        self.rssi
    }

    /// Whether the device is currently paired.
    pub fn paired(&self) -> bool {
        self.paired
    }

    /// Whether the device is currently trusted.
    pub fn trusted(&self) -> bool {
        self.trusted
    }

    /// Whether the device is currently blocked.
    pub fn blocked(&self) -> bool {
        self.blocked
    }

    /// The raw class-of-device integer.
    pub fn class(&self) -> u32 {
        self.class
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, crate::properties::PropertyValue)]) -> PropertyMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    use crate::properties::PropertyValue::*;

    #[test]
    fn class_decoder_matches_known_classes() {
        assert_eq!(kind_from_class(0x000100), DeviceKind::Computer);
        assert_eq!(kind_from_class(0x000200), DeviceKind::Phone);
        assert_eq!(kind_from_class(0x240404), DeviceKind::AudioSink); // headset
        assert_eq!(kind_from_class(0x240408), DeviceKind::AudioSink); // hands-free
        assert_eq!(kind_from_class(0x24040C), DeviceKind::AudioSource); // microphone, minor 0x03
        assert_eq!(kind_from_class(0x240418), DeviceKind::AudioSink); // other a/v minor class
        assert_eq!(kind_from_class(0x000504), DeviceKind::Keyboard); // minor 0x01
        assert_eq!(kind_from_class(0x00050C), DeviceKind::Keyboard); // minor 0x03 combo
        assert_eq!(kind_from_class(0x000508), DeviceKind::Mouse); // minor 0x02
        assert_eq!(kind_from_class(0x000520), DeviceKind::Input); // other peripheral
        assert_eq!(kind_from_class(0x000300), DeviceKind::Unknown);
    }

    #[test]
    fn class_decoder_depends_only_on_bits_2_through_12() {
        // Flip service-class bits (13-23) and format bits (0-1); kind must not change.
        let base = 0x240404u32;
        let with_service_bits = base | (0b111 << 13);
        let with_format_bits = base | 0b11;
        assert_eq!(kind_from_class(base), kind_from_class(with_service_bits));
        assert_eq!(kind_from_class(base), kind_from_class(with_format_bits));
    }

    #[test]
    fn missing_address_yields_no_device() {
        let p = props(&[(("Name"), Str("Foo".into()))]);
        assert!(Device::from_properties(&p).is_none());
    }

    #[test]
    fn empty_name_and_alias_falls_back_to_address() {
        let p = props(&[("Address", Str("11:22:33:44:55:66".into())), ("Name", Str("".into()))]);
        let d = Device::from_properties(&p).unwrap();
        assert_eq!(d.alias(), "11:22:33:44:55:66");
    }

    #[test]
    fn empty_alias_falls_back_to_name() {
        let p = props(&[("Address", Str("11:22:33:44:55:66".into())), ("Name", Str("Foo".into()))]);
        let d = Device::from_properties(&p).unwrap();
        assert_eq!(d.alias(), "Foo");
    }

    #[test]
    fn merge_preserves_unlisted_fields() {
        let p = props(&[
            ("Address", Str("11:22:33:44:55:66".into())),
            ("Name", Str("Foo".into())),
            ("Class", U32(0x240404)),
        ]);
        let mut d = Device::from_properties(&p).unwrap();
        d.merge_properties(&props(&[("RSSI", I8(-55))]));
        assert_eq!(d.rssi(), Some(-55));
        assert_eq!(d.name(), "Foo");
        assert_eq!(d.kind(), DeviceKind::AudioSink);
    }

    #[test]
    fn explicit_alias_survives_rssi_only_update() {
        let p = props(&[("Address", Str("11:22:33:44:55:66".into())), ("Name", Str("Foo".into()))]);
        let mut d = Device::from_properties(&p).unwrap();
        d.set_alias("Quux".into());
        d.merge_properties(&props(&[("RSSI", I8(-10))]));
        assert_eq!(d.alias(), "Quux");
    }
}
