use std::fs::{File, OpenOptions};
use std::io::Write;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

/// What to record in the NDJSON traffic log: every remote call, or only the
/// calls that change something on the robot.
pub enum TrafficLogMode {
    Full,
    Actions,
}

pub(crate) struct TrafficLogger {
    mode: TrafficLogMode,
    file: File,
}

impl TrafficLogger {
    pub fn new(mode: TrafficLogMode, path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { mode, file })
    }

    /// Session-level HTTP calls (authenticate, list robots).
    pub fn log_http(&mut self, method: &str, path: &str) {
        if matches!(self.mode, TrafficLogMode::Actions) {
            return;
        }
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "http",
            "method": method,
            "path": path,
        });
        self.write_line(&entry);
    }

    /// Per-robot message calls. `mutating` marks calls that change robot
    /// state; Actions mode drops everything else.
    pub fn log_message(&mut self, serial: &str, cmd: &str, params: &Value, mutating: bool) {
        if matches!(self.mode, TrafficLogMode::Actions) && !mutating {
            return;
        }
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "msg",
            "serial": serial,
            "cmd": cmd,
            "params": params,
        });
        self.write_line(&entry);
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write log entry: {e}");
        }
    }
}
