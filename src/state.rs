use std::fmt;

/// Lifecycle state of a supervised virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Unknown,
    /// The VM is initializing (or incoming via migration) but not running yet.
    Prelaunch,
    Running,
    Paused,
    Suspended,
    Shutdown,
    Crashed,
}

impl VmState {
    /// Maps a QMP `query-status` string onto a state. Total: unrecognized
    /// status strings become [`VmState::Unknown`].
    pub fn parse(status: &str) -> VmState {
        match status {
            "running" => VmState::Running,
            "paused" => VmState::Paused,
            "suspended" => VmState::Suspended,
            "prelaunch" | "inmigrate" => VmState::Prelaunch,
            "shutdown" => VmState::Shutdown,
            "internal-error" | "io-error" => VmState::Crashed,
            _ => VmState::Unknown,
        }
    }

    /// Maps a QMP event name onto the state it implies. Events outside this
    /// set carry no state change.
    pub fn from_event(name: &str) -> Option<VmState> {
        match name {
            "SHUTDOWN" => Some(VmState::Shutdown),
            "RESET" => Some(VmState::Running),
            "STOP" => Some(VmState::Paused),
            "RESUME" => Some(VmState::Running),
            "SUSPEND" => Some(VmState::Suspended),
            "WAKEUP" => Some(VmState::Running),
            _ => None,
        }
    }

    /// True while the guest still holds resources worth supervising.
    pub fn is_alive(self) -> bool {
        matches!(
            self,
            VmState::Prelaunch | VmState::Running | VmState::Paused | VmState::Suspended
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Unknown => "unknown",
            VmState::Prelaunch => "prelaunch",
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::Suspended => "suspended",
            VmState::Shutdown => "shutdown",
            VmState::Crashed => "crashed",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_maps_known_status_strings() {
        let cases = [
            ("running", VmState::Running),
            ("paused", VmState::Paused),
            ("suspended", VmState::Suspended),
            ("prelaunch", VmState::Prelaunch),
            ("inmigrate", VmState::Prelaunch),
            ("shutdown", VmState::Shutdown),
            ("internal-error", VmState::Crashed),
            ("io-error", VmState::Crashed),
        ];
        for (status, expected) in cases {
            assert_eq!(VmState::parse(status), expected, "status {status}");
        }
    }

    #[test]
    fn parse_is_total_over_unknown_strings() {
        for status in ["", "finish-migrate", "colo", "no-such-status"] {
            assert_eq!(VmState::parse(status), VmState::Unknown);
        }
    }

    #[test]
    fn alive_states_match_lifecycle() {
        assert!(VmState::Prelaunch.is_alive());
        assert!(VmState::Running.is_alive());
        assert!(VmState::Paused.is_alive());
        assert!(VmState::Suspended.is_alive());
        assert!(!VmState::Unknown.is_alive());
        assert!(!VmState::Shutdown.is_alive());
        assert!(!VmState::Crashed.is_alive());
    }

    #[test]
    fn events_map_onto_states() {
        assert_eq!(VmState::from_event("SHUTDOWN"), Some(VmState::Shutdown));
        assert_eq!(VmState::from_event("RESET"), Some(VmState::Running));
        assert_eq!(VmState::from_event("STOP"), Some(VmState::Paused));
        assert_eq!(VmState::from_event("RESUME"), Some(VmState::Running));
        assert_eq!(VmState::from_event("SUSPEND"), Some(VmState::Suspended));
        assert_eq!(VmState::from_event("WAKEUP"), Some(VmState::Running));
        assert_eq!(VmState::from_event("BLOCK_IO_ERROR"), None);
        assert_eq!(VmState::from_event("NIC_RX_FILTER_CHANGED"), None);
    }

    #[test]
    fn stop_then_resume_round_trips_to_running() {
        let stopped = VmState::from_event("STOP").unwrap();
        assert_eq!(stopped, VmState::Paused);
        let resumed = VmState::from_event("RESUME").unwrap();
        assert_eq!(resumed, VmState::Running);
    }

    #[test]
    fn display_uses_lowercase_names() {
        assert_eq!(VmState::Running.to_string(), "running");
        assert_eq!(VmState::Crashed.to_string(), "crashed");
    }
}
