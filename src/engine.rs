use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::bus::{Bus, StateEvent, Value};
use crate::cloud::CloudClient;
use crate::logger::{TrafficLogMode, TrafficLogger};
use crate::schedule::{self, NewEntry};
use crate::types::{cleaning_label, Robot, ScheduleVariant};
use crate::{reconcile, schema, Error, Result};

/// The poll interval floor. Configured intervals below this are clamped.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Where the sync loop currently is. Failures never leave this machine;
/// they re-enter through Backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Authenticating,
    Discovering,
    Reconciling,
    Ready,
    Polling,
    Faulted,
    Backoff,
}

/// Per-session state, rebuilt wholesale on every authentication pass so a
/// superseded session leaves nothing behind.
struct SessionState {
    robots: BTreeMap<String, Robot>,
}

pub struct SyncEngineBuilder {
    base_url: String,
    email: String,
    secret: String,
    namespace: String,
    poll_interval: Duration,
    long_backoff: Duration,
    resync_delay: Duration,
    log_mode: Option<TrafficLogMode>,
    log_path: Option<String>,
}

impl SyncEngineBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            email: String::new(),
            secret: String::new(),
            namespace: "robovac".to_string(),
            poll_interval: Duration::from_secs(60),
            long_backoff: Duration::from_secs(300),
            resync_delay: Duration::from_secs(1),
            log_mode: None,
            log_path: None,
        }
    }

    pub fn credentials(mut self, email: impl Into<String>, secret: impl Into<String>) -> Self {
        self.email = email.into();
        self.secret = secret.into();
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Desired poll interval. Clamped to a 60 s floor at use.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Delay before retrying after authentication, discovery or
    /// reconciliation failures.
    pub fn long_backoff(mut self, backoff: Duration) -> Self {
        self.long_backoff = backoff;
        self
    }

    /// Delay between a successful action and its follow-up re-sync.
    pub fn resync_delay(mut self, delay: Duration) -> Self {
        self.resync_delay = delay;
        self
    }

    pub fn traffic_log(mut self, mode: TrafficLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self, bus: Arc<dyn Bus>) -> SyncEngine {
        let http = reqwest::Client::builder()
            .build()
            .expect("failed to build HTTP client");

        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => {
                Some(TrafficLogger::new(mode, &path).expect("failed to open log file"))
            }
            _ => None,
        };

        SyncEngine {
            cloud: CloudClient::new(http, self.base_url, logger),
            bus,
            namespace: self.namespace,
            email: self.email,
            secret: self.secret,
            poll_interval: self.poll_interval,
            long_backoff: self.long_backoff,
            resync_delay: self.resync_delay,
            phase: Phase::Uninitialized,
            initialized: false,
            session: None,
            events: None,
            pending_resyncs: Vec::new(),
        }
    }
}

/// Bridges the cloud account onto the bus: reconciles the object tree at
/// startup, mirrors robot state on a timer, and turns bus writes back into
/// cloud calls. Single-task; all shared state is owned here.
pub struct SyncEngine {
    cloud: CloudClient,
    bus: Arc<dyn Bus>,
    namespace: String,
    email: String,
    secret: String,
    poll_interval: Duration,
    long_backoff: Duration,
    resync_delay: Duration,
    phase: Phase,
    /// Gate for inbound writes. Cleared on every restart so callbacks from a
    /// superseded session are dropped.
    initialized: bool,
    session: Option<SessionState>,
    events: Option<mpsc::UnboundedReceiver<StateEvent>>,
    pending_resyncs: Vec<(Instant, String)>,
}

impl SyncEngine {
    pub fn builder(base_url: impl Into<String>) -> SyncEngineBuilder {
        SyncEngineBuilder::new(base_url)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn effective_poll_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }

    /// Bring one session up: authenticate, discover robots, reconcile the
    /// bus tree, subscribe to writes, then run the first poll pass.
    pub async fn start(&mut self) -> Result<()> {
        self.initialized = false;
        self.session = None;
        self.events = None;
        self.pending_resyncs.clear();

        self.phase = Phase::Authenticating;
        self.cloud.authenticate(&self.email, &self.secret).await?;

        self.phase = Phase::Discovering;
        let infos = self.cloud.list_robots().await?;
        if infos.is_empty() {
            return Err(Error::NoRobots);
        }

        self.phase = Phase::Reconciling;
        let mut robots = BTreeMap::new();
        let mut schemas = BTreeMap::new();
        for info in infos {
            let state = self.cloud.get_state(&info.serial).await?;
            let robot = Robot::new(info, &state);
            schemas.insert(robot.name.clone(), schema::build_device_schema(&state));
            robots.insert(robot.name.clone(), robot);
        }
        let report = reconcile::reconcile(self.bus.as_ref(), &schemas).await?;
        info!(
            robots = robots.len(),
            states_created = report.states_created,
            states_deleted = report.states_deleted,
            stale = report.stale_devices.len(),
            "bus tree reconciled"
        );

        self.events = Some(self.bus.subscribe());
        self.session = Some(SessionState { robots });
        self.initialized = true;
        self.phase = Phase::Ready;

        self.poll().await
    }

    /// One poll pass over every known robot. A single fetch failure marks
    /// that robot unreachable and faults the whole session; the cloud
    /// session itself is assumed dead.
    pub async fn poll(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::NotAuthenticated);
        };
        self.phase = Phase::Polling;
        for (name, robot) in session.robots.iter_mut() {
            if let Err(e) =
                sync_robot(&mut self.cloud, self.bus.as_ref(), &self.namespace, robot).await
            {
                warn!(robot = %name, error = %e, "could not update robot");
                let path = format!("{}.{name}.status.reachable", self.namespace);
                if let Err(be) = self.bus.set_state(&path, Value::Bool(false), true).await {
                    warn!(robot = %name, error = %be, "could not mark robot unreachable");
                }
                self.phase = Phase::Faulted;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drive the engine forever: session startup with backoff on failure,
    /// then a select loop over the poll timer, inbound bus writes and
    /// pending re-syncs. Returns only when the bus event stream closes.
    pub async fn run(&mut self) {
        loop {
            if let Err(e) = self.start().await {
                warn!(error = %e, "session startup failed");
                self.backoff().await;
                continue;
            }

            let Some(mut rx) = self.events.take() else { return };
            let interval = self.effective_poll_interval();
            let mut next_tick = Instant::now() + interval;
            let mut faulted = false;

            while !faulted {
                let resync_at = self.pending_resyncs.iter().map(|(at, _)| *at).min();
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => self.handle_event(&event).await,
                        None => {
                            debug!("bus event stream closed, stopping");
                            return;
                        }
                    },
                    _ = time::sleep_until(next_tick) => {
                        match self.poll().await {
                            Ok(()) => next_tick = Instant::now() + interval,
                            Err(e) => {
                                warn!(error = %e, "poll failed, restarting session");
                                faulted = true;
                            }
                        }
                    },
                    _ = time::sleep_until(resync_at.unwrap_or_else(Instant::now)), if resync_at.is_some() => {
                        self.run_due_resyncs().await;
                    },
                }
            }

            self.backoff().await;
        }
    }

    /// Tear the session down and wait before the next restart. Polling
    /// faults wait one poll interval; everything earlier takes the long
    /// backoff.
    async fn backoff(&mut self) {
        let delay = match self.phase {
            Phase::Polling | Phase::Faulted => self.effective_poll_interval(),
            _ => self.long_backoff,
        };
        self.phase = Phase::Backoff;
        self.initialized = false;
        self.session = None;
        self.events = None;
        self.pending_resyncs.clear();
        debug!(seconds = delay.as_secs(), "backing off before restart");
        time::sleep(delay).await;
    }

    /// React to one bus write. Command errors never propagate: every
    /// rejection reverts the visible value or re-syncs, and logs.
    pub async fn handle_event(&mut self, event: &StateEvent) {
        if event.ack {
            return;
        }
        if !self.initialized {
            debug!(path = %event.path, "write received before engine is ready, ignored");
            return;
        }
        let Some((device, channel, state)) = parse_path(&self.namespace, &event.path) else {
            debug!(path = %event.path, "write outside adapter namespace, ignored");
            return;
        };
        let known = self
            .session
            .as_ref()
            .is_some_and(|s| s.robots.contains_key(device));
        if !known {
            warn!(device = %device, "state change in unknown device");
            return;
        }
        match channel {
            "commands" => self.handle_command(device, state, &event.value, &event.path).await,
            "schedule" => self.handle_schedule_write(device, state, &event.value, &event.path).await,
            other => warn!(device = %device, channel = %other, "state change in unknown channel"),
        }
    }

    async fn handle_command(&mut self, device: &str, command: &str, value: &Value, path: &str) {
        let Some(session) = self.session.as_mut() else { return };
        let Some(robot) = session.robots.get_mut(device) else { return };

        match command {
            "clean" | "cleanSpot" | "pause" | "resume" | "stop" | "goToBase" => {
                let Some(requested) = value.as_bool() else {
                    warn!(robot = %robot.name, command, "expected a boolean command value");
                    return;
                };
                if !requested {
                    // buttons are momentary; the opposing command ends the
                    // current activity
                    warn!(robot = %robot.name, command, "use the opposing command instead of writing false");
                    if let Err(e) = self.bus.set_state(path, Value::Bool(false), true).await {
                        warn!(error = %e, "could not revert command state");
                    }
                    return;
                }

                // refresh the gating flags right before acting
                if let Err(e) =
                    sync_robot(&mut self.cloud, self.bus.as_ref(), &self.namespace, robot).await
                {
                    warn!(robot = %robot.name, command, error = %e, "refresh before command failed, dropping command");
                    return;
                }

                let allowed = match command {
                    "clean" | "cleanSpot" => robot.can_start(),
                    "pause" => robot.can_pause(),
                    "resume" => robot.can_resume(),
                    "stop" => robot.can_stop(),
                    _ => robot.can_go_to_base(),
                };
                if !allowed {
                    warn!(robot = %robot.name, command, "robot cannot do this right now");
                    if let Err(e) = self.bus.set_state(path, Value::Bool(false), true).await {
                        warn!(error = %e, "could not revert command state");
                    }
                    return;
                }

                let result = match command {
                    "clean" => {
                        let (category, mode, modifier) = robot.house_params();
                        self.cloud.start_cleaning(&robot.serial, category, mode, modifier).await
                    }
                    "cleanSpot" => {
                        let params = robot.spot_params();
                        self.cloud.start_spot_cleaning(&robot.serial, &params).await
                    }
                    "pause" => self.cloud.pause_cleaning(&robot.serial).await,
                    "resume" => self.cloud.resume_cleaning(&robot.serial).await,
                    "stop" => self.cloud.stop_cleaning(&robot.serial).await,
                    _ => self.cloud.send_to_base(&robot.serial).await,
                };
                match result {
                    Ok(result) if result == "ok" => {
                        if let Err(e) = self.bus.set_state(path, Value::Bool(true), true).await {
                            warn!(error = %e, "could not confirm command state");
                        }
                        self.pending_resyncs
                            .push((Instant::now() + self.resync_delay, device.to_string()));
                    }
                    Ok(result) => {
                        warn!(robot = %robot.name, command, result = %result, "cloud rejected command");
                        if let Err(e) = self.bus.set_state(path, Value::Bool(false), true).await {
                            warn!(error = %e, "could not revert command state");
                        }
                    }
                    Err(e) => {
                        warn!(robot = %robot.name, command, error = %e, "command failed");
                        if let Err(e) = self.bus.set_state(path, Value::Bool(false), true).await {
                            warn!(error = %e, "could not revert command state");
                        }
                    }
                }
            }
            "schedule" => {
                let Some(enable) = value.as_bool() else {
                    warn!(robot = %robot.name, "expected a boolean schedule switch");
                    return;
                };
                let result = if enable {
                    self.cloud.enable_schedule(&robot.serial).await
                } else {
                    self.cloud.disable_schedule(&robot.serial).await
                };
                match result {
                    Ok(result) if result == "ok" => {
                        if let Err(e) = self.bus.set_state(path, Value::Bool(enable), true).await {
                            warn!(error = %e, "could not confirm schedule switch");
                        }
                        self.pending_resyncs
                            .push((Instant::now() + self.resync_delay, device.to_string()));
                    }
                    other => {
                        match other {
                            Ok(result) => warn!(robot = %robot.name, enable, result = %result, "cloud rejected schedule switch"),
                            Err(e) => warn!(robot = %robot.name, enable, error = %e, "schedule switch failed"),
                        }
                        // revert to the pre-command value
                        if let Err(e) = self.bus.set_state(path, Value::Bool(!enable), true).await {
                            warn!(error = %e, "could not revert schedule switch");
                        }
                    }
                }
            }
            "eco" | "spotRepeat" | "noGoLines" => {
                let Some(on) = value.as_bool() else {
                    warn!(robot = %robot.name, command, "expected a boolean value");
                    return;
                };
                match command {
                    "eco" => robot.set_eco(on),
                    "spotRepeat" => robot.set_spot_repeat(on),
                    _ => robot.set_no_go_lines(on),
                }
                if let Err(e) = self.bus.set_state(path, Value::Bool(on), true).await {
                    warn!(error = %e, "could not acknowledge setting");
                }
            }
            "spotWidth" | "spotHeight" => {
                let Some(cm) = value.as_f64() else {
                    warn!(robot = %robot.name, command, "expected a numeric value");
                    return;
                };
                if command == "spotWidth" {
                    robot.set_spot_width(cm as i64);
                } else {
                    robot.set_spot_height(cm as i64);
                }
                if let Err(e) = self.bus.set_state(path, Value::Num(cm), true).await {
                    warn!(error = %e, "could not acknowledge setting");
                }
            }
            other => warn!(robot = %robot.name, command = %other, "unknown command"),
        }
    }

    async fn handle_schedule_write(&mut self, device: &str, state: &str, value: &Value, path: &str) {
        let Some(session) = self.session.as_mut() else { return };
        let Some(robot) = session.robots.get_mut(device) else { return };
        if robot.variant == ScheduleVariant::None {
            warn!(robot = %robot.name, "robot has no schedule service");
            return;
        }

        let Some((day, field)) = state.split_once('-') else {
            warn!(robot = %robot.name, state, "malformed schedule state name");
            return;
        };
        let day: u8 = match day.parse() {
            Ok(d) if d <= 6 => d,
            _ => {
                warn!(robot = %robot.name, state, "invalid weekday in schedule write");
                return;
            }
        };
        if field != "startTime" {
            warn!(robot = %robot.name, state, "only startTime is writable, mode and boundaryId mirror the device");
            return;
        }

        let start_time = match value {
            Value::Str(s) => s.clone(),
            _ => {
                warn!(robot = %robot.name, state, "expected a string start time");
                resync_quietly(&mut self.cloud, self.bus.as_ref(), &self.namespace, robot).await;
                return;
            }
        };
        if let Err(e) = schedule::check_start_time(&start_time) {
            warn!(robot = %robot.name, day, error = %e, "rejecting schedule edit");
            resync_quietly(&mut self.cloud, self.bus.as_ref(), &self.namespace, robot).await;
            return;
        }

        // always fetch the whole week fresh; other days may have changed
        // out-of-band
        let fetched = match self.cloud.get_schedule(&robot.serial).await {
            Ok(s) => s,
            Err(e) => {
                warn!(robot = %robot.name, error = %e, "could not fetch schedule for merge");
                resync_quietly(&mut self.cloud, self.bus.as_ref(), &self.namespace, robot).await;
                return;
            }
        };
        let events = fetched.events;

        let new_entry = if !events.iter().any(|e| e.day == day) && !start_time.is_empty() {
            let mut entry = NewEntry::default();
            if robot.variant.has_mode() {
                let mirror = format!("{}.{device}.schedule.{day}-mode", self.namespace);
                match self.bus.get_state(&mirror).await {
                    Ok(Some(sv)) if sv.value.as_f64().is_some() => {
                        entry.mode = sv.value.as_f64().map(|m| m as i64);
                    }
                    _ => {
                        warn!(robot = %robot.name, day, "no mirrored mode for this day, cannot create entry");
                        resync_quietly(&mut self.cloud, self.bus.as_ref(), &self.namespace, robot).await;
                        return;
                    }
                }
            }
            if robot.variant.has_boundary_id() {
                let mirror = format!("{}.{device}.schedule.{day}-boundaryId", self.namespace);
                match self.bus.get_state(&mirror).await {
                    Ok(Some(sv)) if sv.value.as_str().is_some() => {
                        entry.boundary_id = sv.value.as_str().map(str::to_string);
                    }
                    _ => {
                        warn!(robot = %robot.name, day, "no mirrored boundary id for this day, cannot create entry");
                        resync_quietly(&mut self.cloud, self.bus.as_ref(), &self.namespace, robot).await;
                        return;
                    }
                }
            }
            Some(entry)
        } else {
            None
        };

        let merged = match schedule::apply_start_time_edit(events, day, &start_time, new_entry) {
            Ok(merged) => merged,
            Err(e) => {
                warn!(robot = %robot.name, day, error = %e, "schedule edit rejected");
                resync_quietly(&mut self.cloud, self.bus.as_ref(), &self.namespace, robot).await;
                return;
            }
        };

        match self.cloud.set_schedule(&robot.serial, &merged).await {
            Ok(()) => {
                if let Err(e) = self.bus.set_state(path, Value::Str(start_time), true).await {
                    warn!(error = %e, "could not acknowledge schedule edit");
                }
            }
            Err(e) => {
                warn!(robot = %robot.name, error = %e, "could not write schedule back, discarding edit");
                resync_quietly(&mut self.cloud, self.bus.as_ref(), &self.namespace, robot).await;
            }
        }
    }

    async fn run_due_resyncs(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        self.pending_resyncs.retain(|(at, name)| {
            if *at <= now {
                due.push(name.clone());
                false
            } else {
                true
            }
        });
        let Some(session) = self.session.as_mut() else { return };
        for name in due {
            if let Some(robot) = session.robots.get_mut(&name) {
                resync_quietly(&mut self.cloud, self.bus.as_ref(), &self.namespace, robot).await;
            }
        }
    }

    /// Wait out and run every scheduled re-sync. Mainly useful for tests
    /// and stepwise callers that do not use `run()`.
    pub async fn flush_resyncs(&mut self) {
        while let Some(at) = self.pending_resyncs.iter().map(|(at, _)| *at).min() {
            time::sleep_until(at).await;
            self.run_due_resyncs().await;
        }
    }
}

/// Fetch one robot's live status and schedule and project them onto the bus,
/// all acked. Also refreshes the in-memory handle and resets momentary
/// command buttons whose capability flag came back true.
async fn sync_robot(
    cloud: &mut CloudClient,
    bus: &dyn Bus,
    namespace: &str,
    robot: &mut Robot,
) -> Result<()> {
    let state = cloud.get_state(&robot.serial).await?;
    robot.refresh(&state);

    let name = &robot.name;
    let status = |field: &str| format!("{namespace}.{name}.status.{field}");
    let command = |field: &str| format!("{namespace}.{name}.commands.{field}");

    bus.set_state(&status("reachable"), Value::Bool(true), true).await?;
    bus.set_state(&status("lastResult"), Value::Str(state.result.clone()), true).await?;
    bus.set_state(&status("error"), Value::Str(state.error.clone().unwrap_or_default()), true).await?;
    bus.set_state(&status("state"), Value::Num(state.state as f64), true).await?;
    bus.set_state(&status("action"), Value::Num(state.action as f64), true).await?;
    bus.set_state(&status("lastCleaning"), Value::Str(cleaning_label(&state.cleaning)), true).await?;
    bus.set_state(&status("isCharging"), Value::Bool(state.details.is_charging), true).await?;
    bus.set_state(&status("isDocked"), Value::Bool(state.details.is_docked), true).await?;
    bus.set_state(&status("isScheduleEnabled"), Value::Bool(state.details.is_schedule_enabled), true).await?;
    bus.set_state(&status("dockHasBeenSeen"), Value::Bool(state.details.dock_has_been_seen), true).await?;
    bus.set_state(&status("charge"), Value::Num(state.details.charge), true).await?;
    bus.set_state(&status("modelName"), Value::Str(state.meta.model_name.clone()), true).await?;
    bus.set_state(&status("firmware"), Value::Str(state.meta.firmware.clone()), true).await?;
    if robot.has_bin_sensor {
        bus.set_state(&status("isBinFull"), Value::Bool(state.details.is_bin_full.unwrap_or(false)), true).await?;
        bus.set_state(&status("alert"), Value::Str(state.alert.clone().unwrap_or_default()), true).await?;
    }

    // mirror the gating flags, and make the buttons momentary: once an
    // action's flag is back, the button falls back to false
    let gates: [(&str, bool, &[&str]); 5] = [
        ("canStart", state.available_commands.start, &["clean", "cleanSpot"]),
        ("canStop", state.available_commands.stop, &["stop"]),
        ("canPause", state.available_commands.pause, &["pause"]),
        ("canResume", state.available_commands.resume, &["resume"]),
        ("canGoToBase", state.available_commands.go_to_base, &["goToBase"]),
    ];
    for (flag, set, buttons) in gates {
        bus.set_state(&status(flag), Value::Bool(set), true).await?;
        if set {
            for button in buttons {
                bus.set_state(&command(button), Value::Bool(false), true).await?;
            }
        }
    }
    bus.set_state(&command("schedule"), Value::Bool(state.details.is_schedule_enabled), true).await?;

    if robot.variant != ScheduleVariant::None {
        let fetched = cloud.get_schedule(&robot.serial).await?;
        for day in 0..=6u8 {
            let prefix = format!("{namespace}.{name}.schedule.{day}");
            match fetched.events.iter().find(|e| e.day == day) {
                Some(entry) => {
                    bus.set_state(&format!("{prefix}-startTime"), Value::Str(entry.start_time.clone()), true).await?;
                    if robot.variant.has_mode()
                        && let Some(mode) = entry.mode
                    {
                        bus.set_state(&format!("{prefix}-mode"), Value::Num(mode as f64), true).await?;
                    }
                    if robot.variant.has_boundary_id()
                        && let Some(boundary) = &entry.boundary_id
                    {
                        bus.set_state(&format!("{prefix}-boundaryId"), Value::Str(boundary.clone()), true).await?;
                    }
                }
                // clear stale days
                None => {
                    bus.set_state(&format!("{prefix}-startTime"), Value::Str(String::new()), true).await?;
                }
            }
        }
    }

    Ok(())
}

/// Targeted best-effort re-sync: restores bus-displayed truth after a
/// rejected edit or a completed action. Failures are logged, never fatal.
async fn resync_quietly(cloud: &mut CloudClient, bus: &dyn Bus, namespace: &str, robot: &mut Robot) {
    if let Err(e) = sync_robot(cloud, bus, namespace, robot).await {
        debug!(robot = %robot.name, error = %e, "targeted re-sync failed");
    }
}

/// Split a fully qualified state path into (device, channel, state),
/// requiring exactly this engine's namespace prefix.
fn parse_path<'a>(namespace: &str, path: &'a str) -> Option<(&'a str, &'a str, &'a str)> {
    let rest = path.strip_prefix(namespace)?.strip_prefix('.')?;
    let mut parts = rest.split('.');
    let (device, channel, state) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || device.is_empty() || channel.is_empty() || state.is_empty() {
        return None;
    }
    Some((device, channel, state))
}
