use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which schedule service a robot exposes. Determines the shape of the
/// schedule channel and which per-day fields a write-back must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleVariant {
    None,
    Minimal1,
    Basic1,
    Basic2,
}

impl ScheduleVariant {
    pub fn from_services(services: &AvailableServices) -> Self {
        match services.schedule.as_deref() {
            None | Some("none") => ScheduleVariant::None,
            Some("minimal-1") => ScheduleVariant::Minimal1,
            Some("basic-1") => ScheduleVariant::Basic1,
            Some("basic-2") => ScheduleVariant::Basic2,
            Some(other) => {
                debug!(tag = other, "unrecognized schedule variant, assuming minimal-1");
                ScheduleVariant::Minimal1
            }
        }
    }

    /// Whether per-day entries carry a numeric cleaning mode.
    pub fn has_mode(&self) -> bool {
        matches!(self, ScheduleVariant::Basic1 | ScheduleVariant::Basic2)
    }

    /// Whether per-day entries carry a map boundary id.
    pub fn has_boundary_id(&self) -> bool {
        matches!(self, ScheduleVariant::Basic2)
    }
}

/// One robot as listed by the cloud account.
#[derive(Debug, Clone, Deserialize)]
pub struct RobotInfo {
    pub serial: String,
    pub name: String,
}

/// Full state snapshot returned by `getRobotState`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotState {
    pub result: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub alert: Option<String>,
    pub state: i64,
    pub action: i64,
    pub cleaning: Cleaning,
    pub details: Details,
    pub available_commands: AvailableCommands,
    #[serde(default)]
    pub available_services: AvailableServices,
    pub meta: Meta,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cleaning {
    pub category: i64,
    pub mode: i64,
    pub modifier: i64,
    #[serde(default)]
    pub spot_width: i64,
    #[serde(default)]
    pub spot_height: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Details {
    pub is_charging: bool,
    pub is_docked: bool,
    pub is_schedule_enabled: bool,
    pub dock_has_been_seen: bool,
    pub charge: f64,
    /// Absent on models without a bin sensor.
    #[serde(default)]
    pub is_bin_full: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableCommands {
    pub start: bool,
    pub stop: bool,
    pub pause: bool,
    pub resume: bool,
    pub go_to_base: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableServices {
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub house_cleaning: Option<String>,
    #[serde(default)]
    pub spot_cleaning: Option<String>,
    /// Present on models with persistent maps, which also carry nogo lines.
    #[serde(default)]
    pub maps: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub model_name: String,
    pub firmware: String,
}

/// Weekly schedule as fetched from the cloud. Only the events are modeled:
/// the write-back payload carries events alone, and the enabled flag is
/// mirrored from the state snapshot instead, so it never round-trips.
#[derive(Debug, Clone, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub events: Vec<ScheduleEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEvent {
    pub day: u8,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundary_id: Option<String>,
}

/// Human-readable label for the last cleaning run, combined from the
/// cleaning category, mode and modifier fields.
pub fn cleaning_label(cleaning: &Cleaning) -> String {
    let mut label = match cleaning.category {
        1 => "manual",
        3 => "spot",
        4 => "house with nogo lines",
        _ => "house",
    }
    .to_string();
    label.push_str(if cleaning.mode == 1 { " eco" } else { " turbo" });
    if cleaning.modifier == 2 {
        label.push_str(" x2");
    }
    label
}

/// Replace characters that would break a bus path segment.
pub fn sanitize_node_id(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == '.' || c == '*' || c == '?' || c == '[' || c == ']' || c.is_whitespace() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Spot-cleaning parameters derived from a robot's local configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotParams {
    pub mode: i64,
    pub modifier: i64,
    pub width: i64,
    pub height: i64,
}

/// In-memory handle for one managed robot. Created once at discovery and
/// refreshed in place on every poll so in-flight command handlers observe
/// fresh capability flags.
#[derive(Debug, Clone)]
pub struct Robot {
    pub serial: String,
    /// Sanitized bus node id derived from the cloud display name.
    pub name: String,
    pub display_name: String,
    pub variant: ScheduleVariant,
    pub has_bin_sensor: bool,
    pub has_nogo_lines: bool,
    last: RobotState,
    eco: bool,
    no_go_lines: bool,
    spot_width: i64,
    spot_height: i64,
    spot_repeat: bool,
}

impl Robot {
    pub fn new(info: RobotInfo, state: &RobotState) -> Self {
        let mut robot = Self {
            serial: info.serial,
            name: sanitize_node_id(&info.name),
            display_name: info.name,
            variant: ScheduleVariant::None,
            has_bin_sensor: false,
            has_nogo_lines: false,
            last: state.clone(),
            eco: false,
            no_go_lines: false,
            spot_width: 100,
            spot_height: 100,
            spot_repeat: false,
        };
        robot.refresh(state);
        robot
    }

    /// Absorb a fresh snapshot, re-deriving the capability gates.
    pub fn refresh(&mut self, state: &RobotState) {
        self.variant = ScheduleVariant::from_services(&state.available_services);
        self.has_bin_sensor = state.details.is_bin_full.is_some();
        self.has_nogo_lines = state.available_services.maps.is_some();
        self.last = state.clone();
    }

    pub fn last_state(&self) -> &RobotState {
        &self.last
    }

    pub fn can_start(&self) -> bool {
        self.last.available_commands.start
    }

    pub fn can_stop(&self) -> bool {
        self.last.available_commands.stop
    }

    pub fn can_pause(&self) -> bool {
        self.last.available_commands.pause
    }

    pub fn can_resume(&self) -> bool {
        self.last.available_commands.resume
    }

    pub fn can_go_to_base(&self) -> bool {
        self.last.available_commands.go_to_base
    }

    // Local configuration. Takes effect on the next gated action only.

    pub fn eco(&self) -> bool {
        self.eco
    }

    pub fn set_eco(&mut self, on: bool) {
        self.eco = on;
    }

    pub fn no_go_lines(&self) -> bool {
        self.no_go_lines
    }

    pub fn set_no_go_lines(&mut self, on: bool) {
        self.no_go_lines = on;
    }

    pub fn spot_width(&self) -> i64 {
        self.spot_width
    }

    pub fn set_spot_width(&mut self, cm: i64) {
        self.spot_width = cm;
    }

    pub fn spot_height(&self) -> i64 {
        self.spot_height
    }

    pub fn set_spot_height(&mut self, cm: i64) {
        self.spot_height = cm;
    }

    pub fn spot_repeat(&self) -> bool {
        self.spot_repeat
    }

    pub fn set_spot_repeat(&mut self, on: bool) {
        self.spot_repeat = on;
    }

    /// (category, mode, modifier) for a house cleaning run.
    pub fn house_params(&self) -> (i64, i64, i64) {
        let category = if self.no_go_lines && self.has_nogo_lines { 4 } else { 2 };
        let mode = if self.eco { 1 } else { 2 };
        (category, mode, 1)
    }

    pub fn spot_params(&self) -> SpotParams {
        SpotParams {
            mode: if self.eco { 1 } else { 2 },
            modifier: if self.spot_repeat { 2 } else { 1 },
            width: self.spot_width,
            height: self.spot_height,
        }
    }
}
