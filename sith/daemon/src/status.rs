//! Status dumps
//!
//! `SIGUSR1` logs a JSON snapshot of the running daemon.

use serde::Serialize;

use sith_core::{EngineStatus, Hal, Settings, SithCore};

/// Point-in-time view of the daemon
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// HAL backend name
    pub backend: String,
    /// Backend health
    pub healthy: bool,
    /// Sequence engine snapshot
    pub engine: EngineStatus,
    /// Persisted settings
    pub settings: Settings,
    /// Settings not yet written to storage
    pub settings_dirty: bool,
    /// Open socket connections (`None` on a serial transport)
    pub connections: Option<usize>,
}

impl StatusReport {
    /// Snapshot `core`
    pub fn collect(core: &SithCore, connections: Option<usize>) -> Self {
        Self {
            backend: core.hal().name().to_string(),
            healthy: core.health_check(),
            engine: core.engine().status(),
            settings: core.store().snapshot(),
            settings_dirty: core.store().is_dirty(),
            connections,
        }
    }

    /// Render as pretty JSON
    ///
    /// # Errors
    ///
    /// Serialization failure.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use sith_core::LoggerBackend;

    #[test]
    fn test_report_reflects_running_sequence() {
        let core = SithCore::with_hal(Arc::new(LoggerBackend::new()));
        assert!(core.handle_frame(b":SE02").is_success());

        let report = StatusReport::collect(&core, Some(3));
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["backend"], "logger");
        assert_eq!(json["engine"]["run"]["state"], "running");
        assert_eq!(json["engine"]["run"]["sequence_id"], 2);
        assert_eq!(json["connections"], 3);
        assert_eq!(json["settings"]["startup_sound"], 1);
    }
}
