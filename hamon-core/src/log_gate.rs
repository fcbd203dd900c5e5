// hamon-core: error-log gate
// The disk-hang path must stop writing to the failed disk before demoting;
// it flips this gate and records the suppression event for the admin dump.

use parking_lot::Mutex;

/// Why error logging was turned off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NologReason {
    DemoteOnDiskFail,
    RemoteStop,
}

impl NologReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NologReason::DemoteOnDiskFail => "DEMOTE ON DISK FAILURE",
            NologReason::RemoteStop => "REMOTE STOP",
        }
    }
}

struct GateState {
    enabled: bool,
    event_msg: Option<String>,
}

/// Mutex-guarded logging toggle with the last suppression event.
pub struct LogGate {
    state: Mutex<GateState>,
}

impl LogGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                enabled: true,
                event_msg: None,
            }),
        }
    }

    pub fn enable(&self) {
        let mut state = self.state.lock();
        state.enabled = true;
        state.event_msg = None;
    }

    /// Disable error logging, recording `[timestamp][reason] message`.
    /// Idempotent while already disabled.
    pub fn disable(&self, reason: NologReason, msg: Option<&str>) {
        let mut state = self.state.lock();
        if !state.enabled {
            return;
        }
        state.enabled = false;

        let stamp = chrono::Local::now().format("%m/%d/%y %H:%M:%S%.3f");
        state.event_msg = Some(match msg {
            Some(m) => format!("[{}][{}]{}", stamp, reason.as_str(), m),
            None => format!("[{}][{}]", stamp, reason.as_str()),
        });
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Last suppression event, present only while disabled.
    pub fn event_message(&self) -> Option<String> {
        self.state.lock().event_msg.clone()
    }
}

impl Default for LogGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disable_records_event() {
        let gate = LogGate::new();
        assert!(gate.is_enabled());

        gate.disable(NologReason::DemoteOnDiskFail, Some("eof stalled"));
        assert!(!gate.is_enabled());

        let msg = gate.event_message().unwrap();
        assert!(msg.contains("DEMOTE ON DISK FAILURE"));
        assert!(msg.ends_with("eof stalled"));
    }

    #[test]
    fn test_disable_is_sticky_until_enable() {
        let gate = LogGate::new();
        gate.disable(NologReason::RemoteStop, None);
        let first = gate.event_message();

        // a second disable must not overwrite the recorded event
        gate.disable(NologReason::DemoteOnDiskFail, Some("later"));
        assert_eq!(gate.event_message(), first);

        gate.enable();
        assert!(gate.is_enabled());
        assert!(gate.event_message().is_none());
    }
}
