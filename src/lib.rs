mod bus;
mod cloud;
mod engine;
mod error;
mod logger;
mod reconcile;
mod schedule;
mod schema;
mod types;

pub use bus::{Bus, MemoryBus, StateCommon, StateEvent, StateValue, Value, ValueKind};
pub use cloud::CloudClient;
pub use engine::{Phase, SyncEngine, SyncEngineBuilder};
pub use error::{Error, Result};
pub use logger::TrafficLogMode;
pub use reconcile::{reconcile, ReconcileReport};
pub use schedule::{apply_start_time_edit, check_start_time, NewEntry};
pub use schema::{build_device_schema, ChannelSchema, DeviceSchema};
pub use types::*;
