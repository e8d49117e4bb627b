use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, warn};

use crate::bus::Bus;
use crate::schema::{ChannelSchema, DeviceSchema};
use crate::Result;

/// Counters for one reconciliation pass, plus the devices found on the bus
/// that the cloud no longer reports.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub devices_created: usize,
    pub channels_created: usize,
    pub channels_deleted: usize,
    pub states_created: usize,
    pub states_deleted: usize,
    pub stale_devices: Vec<String>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.devices_created
            + self.channels_created
            + self.channels_deleted
            + self.states_created
            + self.states_deleted
            > 0
    }
}

/// Make the bus object tree match the declarative schemas, level by level:
/// a device pass, then a channel pass, then a state pass, each fully drained
/// before the next. Existing values are never touched; defaults apply only
/// to newly created states. Stale devices are reported, never deleted, so a
/// transient cloud outage cannot wipe a device's history.
///
/// Any bus mutation error aborts the pass and surfaces to the caller's
/// restart path.
pub async fn reconcile(
    bus: &dyn Bus,
    schemas: &BTreeMap<String, DeviceSchema>,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    let existing: BTreeSet<String> = bus.devices().await?.into_iter().collect();
    for device in &existing {
        if !schemas.contains_key(device) {
            warn!(device = %device, "device on bus is no longer reported by the cloud, leaving it in place");
            report.stale_devices.push(device.clone());
        }
    }

    // device pass
    let mut channel_work: VecDeque<(&String, &DeviceSchema, bool)> = VecDeque::new();
    for (device, schema) in schemas {
        let existed = existing.contains(device);
        if !existed {
            bus.create_device(device, device).await?;
            report.devices_created += 1;
        }
        channel_work.push_back((device, schema, existed));
    }

    // channel pass
    let mut state_work: VecDeque<(&String, &String, &ChannelSchema, bool)> = VecDeque::new();
    while let Some((device, schema, device_existed)) = channel_work.pop_front() {
        let current: BTreeSet<String> = if device_existed {
            bus.channels_of(device).await?.into_iter().collect()
        } else {
            BTreeSet::new()
        };
        for (channel, channel_schema) in &schema.channels {
            let existed = current.contains(channel);
            if !existed {
                bus.create_channel(device, channel, &channel_schema.role).await?;
                report.channels_created += 1;
            }
            state_work.push_back((device, channel, channel_schema, existed));
        }
        for channel in &current {
            if !schema.channels.contains_key(channel) {
                debug!(device = %device, channel = %channel, "deleting channel dropped from schema");
                bus.delete_channel(device, channel).await?;
                report.channels_deleted += 1;
            }
        }
    }

    // state pass
    while let Some((device, channel, channel_schema, channel_existed)) = state_work.pop_front() {
        let current: BTreeSet<String> = if channel_existed {
            bus.states_of(device, channel).await?.into_iter().collect()
        } else {
            BTreeSet::new()
        };
        for (state, common) in &channel_schema.states {
            if !current.contains(state) {
                bus.create_state(device, channel, state, common).await?;
                report.states_created += 1;
            }
        }
        for state in &current {
            if !channel_schema.states.contains_key(state) {
                debug!(device = %device, channel = %channel, state = %state, "deleting state dropped from schema");
                bus.delete_state(device, channel, state).await?;
                report.states_deleted += 1;
            }
        }
    }

    Ok(report)
}
