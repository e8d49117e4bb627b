use std::collections::BTreeMap;

use crate::bus::{StateCommon, Value, ValueKind};
use crate::types::{RobotState, ScheduleVariant};

/// Declarative schema of one device's bus subtree. Built from a capability
/// snapshot; the reconciler diffs it against whatever the bus holds.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSchema {
    pub channels: BTreeMap<String, ChannelSchema>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSchema {
    pub role: String,
    pub states: BTreeMap<String, StateCommon>,
}

fn ro(kind: ValueKind, role: &'static str) -> StateCommon {
    StateCommon { kind, read: true, write: false, def: None, role, min: None, unit: None }
}

fn ro_with_default(kind: ValueKind, role: &'static str, def: Value) -> StateCommon {
    StateCommon { kind, read: true, write: false, def: Some(def), role, min: None, unit: None }
}

fn switch() -> StateCommon {
    StateCommon {
        kind: ValueKind::Bool,
        read: true,
        write: true,
        def: Some(Value::Bool(false)),
        role: "switch",
        min: None,
        unit: None,
    }
}

fn spot_dimension(role: &'static str) -> StateCommon {
    StateCommon {
        kind: ValueKind::Num,
        read: true,
        write: true,
        def: Some(Value::Num(100.0)),
        role,
        min: Some(100.0),
        unit: Some("cm"),
    }
}

/// Pure function of the snapshot: same input, same schema, so the
/// reconciler's diff is deterministic.
pub fn build_device_schema(state: &RobotState) -> DeviceSchema {
    let variant = ScheduleVariant::from_services(&state.available_services);
    let has_bin_sensor = state.details.is_bin_full.is_some();
    let has_nogo_lines = state.available_services.maps.is_some();

    let mut status = BTreeMap::new();
    status.insert(
        "reachable".to_string(),
        ro_with_default(ValueKind::Bool, "indicator.reachable", Value::Bool(false)),
    );
    status.insert("lastResult".to_string(), ro(ValueKind::Str, "text"));
    status.insert("error".to_string(), ro(ValueKind::Str, "text"));
    status.insert("state".to_string(), ro(ValueKind::Num, "value"));
    status.insert("action".to_string(), ro(ValueKind::Num, "value"));
    status.insert("lastCleaning".to_string(), ro(ValueKind::Str, "text"));
    status.insert("isCharging".to_string(), ro(ValueKind::Bool, "indicator"));
    status.insert("isDocked".to_string(), ro(ValueKind::Bool, "indicator"));
    status.insert("isScheduleEnabled".to_string(), ro(ValueKind::Bool, "indicator"));
    status.insert("dockHasBeenSeen".to_string(), ro(ValueKind::Bool, "indicator"));
    status.insert("charge".to_string(), ro(ValueKind::Num, "value.battery"));
    status.insert("canStart".to_string(), ro(ValueKind::Bool, "indicator"));
    status.insert("canStop".to_string(), ro(ValueKind::Bool, "indicator"));
    status.insert("canPause".to_string(), ro(ValueKind::Bool, "indicator"));
    status.insert("canResume".to_string(), ro(ValueKind::Bool, "indicator"));
    status.insert("canGoToBase".to_string(), ro(ValueKind::Bool, "indicator"));
    status.insert("modelName".to_string(), ro(ValueKind::Str, "text"));
    status.insert("firmware".to_string(), ro(ValueKind::Str, "text"));
    if has_bin_sensor {
        status.insert("isBinFull".to_string(), ro(ValueKind::Bool, "indicator"));
        status.insert("alert".to_string(), ro(ValueKind::Str, "text"));
    }

    let mut commands = BTreeMap::new();
    for name in ["schedule", "clean", "cleanSpot", "pause", "resume", "stop", "goToBase"] {
        commands.insert(name.to_string(), switch());
    }
    commands.insert("eco".to_string(), switch());
    commands.insert("spotRepeat".to_string(), switch());
    commands.insert("spotWidth".to_string(), spot_dimension("level.width"));
    commands.insert("spotHeight".to_string(), spot_dimension("level.height"));
    if has_nogo_lines {
        commands.insert("noGoLines".to_string(), switch());
    }

    let mut channels = BTreeMap::new();
    channels.insert(
        "status".to_string(),
        ChannelSchema { role: "meta".to_string(), states: status },
    );
    channels.insert(
        "commands".to_string(),
        ChannelSchema { role: "button".to_string(), states: commands },
    );

    if variant != ScheduleVariant::None {
        let mut schedule = BTreeMap::new();
        for day in 0..=6u8 {
            schedule.insert(
                format!("{day}-startTime"),
                StateCommon {
                    kind: ValueKind::Str,
                    read: true,
                    write: true,
                    def: Some(Value::Str(String::new())),
                    role: "text",
                    min: None,
                    unit: None,
                },
            );
            if variant.has_mode() {
                schedule.insert(format!("{day}-mode"), ro(ValueKind::Num, "value"));
            }
            if variant.has_boundary_id() {
                schedule.insert(format!("{day}-boundaryId"), ro(ValueKind::Str, "text"));
            }
        }
        channels.insert(
            "schedule".to_string(),
            ChannelSchema { role: "meta".to_string(), states: schedule },
        );
    }

    DeviceSchema { channels }
}
