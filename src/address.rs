//! Bluetooth address type and the object-path codec.

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

/// A canonical Bluetooth device address: six octets, always rendered
/// uppercase and colon-separated (`AA:BB:CC:DD:EE:FF`).
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates an address from six raw octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Returned when a string does not parse as a canonical Bluetooth address.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid Bluetooth address: {0}")]
pub struct InvalidAddress(pub String);

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, InvalidAddress> {
        let octets: Vec<u8> = s
            .split(':')
            .map(|part| u8::from_str_radix(part, 16).map_err(|_| InvalidAddress(s.to_string())))
            .collect::<Result<_, _>>()?;
        let octets: [u8; 6] = octets.try_into().map_err(|_| InvalidAddress(s.to_string()))?;
        Ok(Self(octets))
    }
}

/// Synthesizes the object path BlueZ would export for `address` on adapter
/// `hci{adapter_index}`.
///
/// `path_of ∘ address_of = id` on valid device paths.
pub fn path_of(adapter_index: u32, address: Address) -> String {
    format!("/org/bluez/hci{adapter_index}/dev_{}", address.to_string().replace(':', "_"))
}

/// Recovers the address embedded in a BlueZ device object path.
///
/// Returns `None` if the trailing `dev_XX_XX_XX_XX_XX_XX` segment is absent
/// or does not decode to a canonical address. `address_of ∘ path_of = id`
/// on canonical addresses.
pub fn address_of(path: &str) -> Option<Address> {
    let segment = path.rsplit('/').next()?;
    let hex = segment.strip_prefix("dev_")?;
    if hex.len() != 17 {
        return None;
    }
    hex.replace('_', ":").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_address() {
        let a: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(a.0, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    }

    #[test]
    fn parse_is_case_insensitive_and_display_is_uppercase() {
        let a: Address = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(a.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn rejects_malformed_address() {
        assert!("AA:BB:CC".parse::<Address>().is_err());
        assert!("AA:BB:CC:DD:EE:ZZ".parse::<Address>().is_err());
    }

    #[test]
    fn path_of_produces_expected_shape() {
        let a: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(path_of(0, a), "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");
    }

    #[test]
    fn address_of_round_trips_through_path_of() {
        let a: Address = "11:22:33:44:55:66".parse().unwrap();
        let path = path_of(0, a);
        assert_eq!(address_of(&path), Some(a));
    }

    #[test]
    fn path_of_round_trips_through_address_of() {
        let path = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";
        let addr = address_of(path).unwrap();
        assert_eq!(path_of(0, addr), path);
    }

    #[test]
    fn address_of_is_case_insensitive() {
        let path = "/org/bluez/hci0/dev_aa_bb_cc_dd_ee_ff";
        assert_eq!(address_of(path).unwrap().to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn address_of_rejects_non_device_paths() {
        assert_eq!(address_of("/org/bluez/hci0"), None);
        assert_eq!(address_of("/org/bluez/hci0/dev_AA_BB_CC"), None);
    }

    #[test]
    fn address_of_ignores_trailing_segments() {
        // A GATT characteristic path hanging off a device still has a
        // `dev_...` component, but it is not the last segment.
        assert_eq!(address_of("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service0012"), None);
    }
}
