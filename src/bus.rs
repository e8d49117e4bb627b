use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Value carried by a bus state node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Num(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Num,
    Str,
}

/// Declared metadata of a state node.
#[derive(Debug, Clone, PartialEq)]
pub struct StateCommon {
    pub kind: ValueKind,
    pub read: bool,
    pub write: bool,
    /// Applied only when the node is newly created and holds no value yet.
    pub def: Option<Value>,
    pub role: &'static str,
    pub min: Option<f64>,
    pub unit: Option<&'static str>,
}

/// Stored value plus its ack flag. `ack == true` means confirmed device
/// state; `ack == false` means a pending command.
#[derive(Debug, Clone, PartialEq)]
pub struct StateValue {
    pub value: Value,
    pub ack: bool,
}

/// Change notification emitted on every `set_state`.
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub path: String,
    pub value: Value,
    pub ack: bool,
}

/// The hierarchical typed state store the engine projects onto. Object
/// creation is namespace-relative; state paths are fully qualified
/// (`<namespace>.<device>.<channel>.<state>`).
#[async_trait]
pub trait Bus: Send + Sync {
    async fn create_device(&self, device: &str, name: &str) -> Result<()>;
    async fn create_channel(&self, device: &str, channel: &str, role: &str) -> Result<()>;
    async fn create_state(
        &self,
        device: &str,
        channel: &str,
        state: &str,
        common: &StateCommon,
    ) -> Result<()>;
    async fn delete_channel(&self, device: &str, channel: &str) -> Result<()>;
    async fn delete_state(&self, device: &str, channel: &str, state: &str) -> Result<()>;

    async fn devices(&self) -> Result<Vec<String>>;
    async fn channels_of(&self, device: &str) -> Result<Vec<String>>;
    async fn states_of(&self, device: &str, channel: &str) -> Result<Vec<String>>;

    async fn set_state(&self, path: &str, value: Value, ack: bool) -> Result<()>;
    async fn get_state(&self, path: &str) -> Result<Option<StateValue>>;

    /// Subscribe to all state changes, acked or not.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<StateEvent>;
}

struct ChannelNode {
    role: String,
    states: BTreeMap<String, StateCommon>,
}

struct DeviceNode {
    name: String,
    channels: BTreeMap<String, ChannelNode>,
}

struct Inner {
    namespace: String,
    devices: BTreeMap<String, DeviceNode>,
    // Values outlive object deletion, as the real store's do: deleting a
    // node removes its declaration, not its last value.
    values: BTreeMap<String, StateValue>,
    subscribers: Vec<mpsc::UnboundedSender<StateEvent>>,
}

/// In-process reference implementation of [`Bus`], used by tests and demos.
pub struct MemoryBus {
    inner: Mutex<Inner>,
}

impl MemoryBus {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                namespace: namespace.into(),
                devices: BTreeMap::new(),
                values: BTreeMap::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("bus lock poisoned")
    }

    /// Declared metadata of a state node, if the node exists.
    pub fn state_common(&self, device: &str, channel: &str, state: &str) -> Option<StateCommon> {
        self.lock()
            .devices
            .get(device)
            .and_then(|d| d.channels.get(channel))
            .and_then(|c| c.states.get(state))
            .cloned()
    }
}

impl Inner {
    fn emit(&mut self, path: &str, value: &Value, ack: bool) {
        self.subscribers.retain(|tx| {
            tx.send(StateEvent {
                path: path.to_string(),
                value: value.clone(),
                ack,
            })
            .is_ok()
        });
    }

    fn store(&mut self, path: String, value: Value, ack: bool) {
        self.values.insert(path.clone(), StateValue { value: value.clone(), ack });
        self.emit(&path, &value, ack);
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn create_device(&self, device: &str, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.devices.entry(device.to_string()).or_insert_with(|| DeviceNode {
            name: name.to_string(),
            channels: BTreeMap::new(),
        });
        Ok(())
    }

    async fn create_channel(&self, device: &str, channel: &str, role: &str) -> Result<()> {
        let mut inner = self.lock();
        let device = inner
            .devices
            .get_mut(device)
            .ok_or_else(|| Error::Bus(format!("no such device: {device}")))?;
        device.channels.entry(channel.to_string()).or_insert_with(|| ChannelNode {
            role: role.to_string(),
            states: BTreeMap::new(),
        });
        Ok(())
    }

    async fn create_state(
        &self,
        device: &str,
        channel: &str,
        state: &str,
        common: &StateCommon,
    ) -> Result<()> {
        let mut inner = self.lock();
        let path = format!("{}.{device}.{channel}.{state}", inner.namespace);
        let node = inner
            .devices
            .get_mut(device)
            .ok_or_else(|| Error::Bus(format!("no such device: {device}")))?
            .channels
            .get_mut(channel)
            .ok_or_else(|| Error::Bus(format!("no such channel: {device}.{channel}")))?;
        node.states.insert(state.to_string(), common.clone());
        if let Some(def) = &common.def
            && !inner.values.contains_key(&path)
        {
            let def = def.clone();
            inner.store(path, def, true);
        }
        Ok(())
    }

    async fn delete_channel(&self, device: &str, channel: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(d) = inner.devices.get_mut(device) {
            d.channels.remove(channel);
        }
        Ok(())
    }

    async fn delete_state(&self, device: &str, channel: &str, state: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(c) = inner.devices.get_mut(device).and_then(|d| d.channels.get_mut(channel)) {
            c.states.remove(state);
        }
        Ok(())
    }

    async fn devices(&self) -> Result<Vec<String>> {
        Ok(self.lock().devices.keys().cloned().collect())
    }

    async fn channels_of(&self, device: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .devices
            .get(device)
            .map(|d| d.channels.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn states_of(&self, device: &str, channel: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .devices
            .get(device)
            .and_then(|d| d.channels.get(channel))
            .map(|c| c.states.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_state(&self, path: &str, value: Value, ack: bool) -> Result<()> {
        self.lock().store(path.to_string(), value, ack);
        Ok(())
    }

    async fn get_state(&self, path: &str) -> Result<Option<StateValue>> {
        Ok(self.lock().values.get(path).cloned())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<StateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }
}
