//! Tunables for the two managers and the connection state they expose.

use std::time::Duration;

/// Construction-time tunables for [`crate::DeviceManager`].
///
/// All fields have defaults chosen to match BlueZ's own behavior when left
/// alone; callers only need to set what they want to change.
#[derive(Debug, Clone)]
pub struct DeviceManagerConfig {
    /// Upper bound on events drained from the bus per Dispatcher tick
    /// before it checks for shutdown and sleeps. Keeping this bounded is
    /// what makes the Dispatcher responsive to `destroy()` under sustained
    /// signal traffic; a tick that fills the bound runs again immediately
    /// instead of sleeping, so a burst drains over several ticks rather
    /// than blocking shutdown on one huge batch.
    pub max_drain_per_tick: usize,
    /// How long the Dispatcher sleeps when a drain pass found nothing.
    pub idle_sleep: Duration,
    /// Timeout for `StartDiscovery`/`StopDiscovery`, `SetDiscoveryFilter`,
    /// and adapter lookups.
    pub adapter_call_timeout: Duration,
    /// How long a `start_discovery` scan runs before it is stopped
    /// automatically, in seconds. `0` means continuous: the scan runs
    /// until an explicit `stop_discovery`.
    pub scan_duration_secs: u64,
    /// Whether to ask the adapter to suppress repeat advertisements for a
    /// device already seen this scan (`Adapter1.SetDiscoveryFilter`'s
    /// `DuplicateData`, inverted). BlueZ's own default is to report every
    /// advertisement, so this defaults to `false`.
    pub filter_duplicates: bool,
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        Self {
            max_drain_per_tick: 64,
            idle_sleep: Duration::from_millis(10),
            adapter_call_timeout: Duration::from_secs(5),
            scan_duration_secs: 0,
            filter_duplicates: false,
        }
    }
}

/// Construction-time tunables for [`crate::ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// Timeout for `Device1.Connect`.
    pub connect_timeout: Duration,
    /// Timeout for `Device1.Disconnect`.
    pub disconnect_timeout: Duration,
    /// Timeout for `Device1.Pair`.
    pub pair_timeout: Duration,
    /// Timeout for `Trusted`/`Blocked` property writes and `RemoveDevice`.
    pub property_call_timeout: Duration,
    /// Whether a successful pairing should also set `Device1.Trusted`.
    pub trust_on_pair: bool,
    /// Whether an unsolicited disconnect should trigger exactly one
    /// reconnect attempt.
    pub auto_reconnect: bool,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            pair_timeout: Duration::from_secs(30),
            property_call_timeout: Duration::from_secs(5),
            trust_on_pair: true,
            auto_reconnect: true,
        }
    }
}

/// A device's connection state as tracked by [`crate::ConnectionManager`].
///
/// Transitions are published before the bus call that causes them and
/// settle into a terminal variant after the call returns; no transition is
/// ever skipped.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, strum::Display)]
pub enum ConnectionState {
    /// No connection attempt is in flight and the device is not connected.
    Disconnected,
    /// `Connect` has been issued and has not yet returned.
    Connecting,
    /// `Connect` returned successfully.
    Connected,
    /// `Disconnect` has been issued and has not yet returned.
    Disconnecting,
    /// The last `Connect` or `Disconnect` call returned an error or timed out.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_manager_config_defaults_are_sane() {
        let cfg = DeviceManagerConfig::default();
        assert!(cfg.max_drain_per_tick > 0);
        assert!(cfg.idle_sleep <= Duration::from_millis(10));
        assert_eq!(cfg.scan_duration_secs, 0, "default scan is continuous");
        assert!(!cfg.filter_duplicates);
    }

    #[test]
    fn connection_manager_config_defaults_match_known_call_budgets() {
        let cfg = ConnectionManagerConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.pair_timeout, Duration::from_secs(30));
        assert!(cfg.trust_on_pair);
        assert!(cfg.auto_reconnect);
    }
}
