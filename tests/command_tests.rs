use std::sync::Arc;
use std::time::Duration;

use robovac_bridge::{Bus, MemoryBus, StateEvent, SyncEngine, Value};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn state_body(can_start: bool) -> serde_json::Value {
    json!({
        "result": "ok",
        "error": null,
        "state": 1,
        "action": 0,
        "cleaning": {"category": 2, "mode": 1, "modifier": 1},
        "details": {
            "isCharging": false,
            "isDocked": true,
            "isScheduleEnabled": true,
            "dockHasBeenSeen": true,
            "charge": 85
        },
        "availableCommands": {
            "start": can_start, "stop": !can_start, "pause": false, "resume": false, "goToBase": false
        },
        "availableServices": {"schedule": "minimal-1"},
        "meta": {"modelName": "BotVac D5", "firmware": "4.2"}
    })
}

fn schedule_body() -> serde_json::Value {
    json!({"result": "ok", "data": {"enabled": true, "events": []}})
}

async fn mount_session(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/me/robots"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"serial": "OBSD1", "name": "Botty"}])),
        )
        .mount(server)
        .await;
}

async fn mount_message(server: &MockServer, cmd: &str, body: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/robots/OBSD1/messages"))
        .and(body_string_contains(cmd))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn started_engine(server: &MockServer, bus: &Arc<MemoryBus>, can_start: bool) -> SyncEngine {
    mount_session(server).await;
    mount_message(server, "getRobotState", state_body(can_start)).await;
    mount_message(server, "getSchedule", schedule_body()).await;
    let mut engine = SyncEngine::builder(server.uri())
        .credentials("user@example.com", "secret")
        .resync_delay(Duration::from_millis(10))
        .build(bus.clone());
    engine.start().await.expect("start should succeed");
    engine
}

fn write(path: &str, value: Value) -> StateEvent {
    StateEvent { path: path.to_string(), value, ack: false }
}

async fn count_cmd(server: &MockServer, cmd: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| String::from_utf8_lossy(&r.body).contains(cmd))
        .count()
}

#[tokio::test]
async fn clean_invokes_start_cleaning_and_resyncs() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(&server, &bus, true).await;
    Mock::given(method("POST"))
        .and(path("/robots/OBSD1/messages"))
        .and(body_string_contains("startCleaning"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "ok"})))
        .expect(1)
        .mount(&server)
        .await;

    let polls_before = count_cmd(&server, "getRobotState").await;
    engine
        .handle_event(&write("robovac.Botty.commands.clean", Value::Bool(true)))
        .await;

    let clean = bus.get_state("robovac.Botty.commands.clean").await.unwrap().unwrap();
    assert_eq!(clean.value, Value::Bool(true));
    assert!(clean.ack);

    // non-eco house run by default
    let requests = server.received_requests().await.unwrap();
    let body = requests
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).to_string())
        .find(|b| b.contains("startCleaning"))
        .unwrap();
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["params"], json!({"category": 2, "mode": 2, "modifier": 1}));

    // the delayed re-sync fires shortly after the action
    engine.flush_resyncs().await;
    assert!(count_cmd(&server, "getRobotState").await > polls_before + 1);
}

#[tokio::test]
async fn guard_false_rejects_without_remote_call() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(&server, &bus, false).await;
    Mock::given(method("POST"))
        .and(path("/robots/OBSD1/messages"))
        .and(body_string_contains("startCleaning"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "ok"})))
        .expect(0)
        .mount(&server)
        .await;

    engine
        .handle_event(&write("robovac.Botty.commands.clean", Value::Bool(true)))
        .await;

    let clean = bus.get_state("robovac.Botty.commands.clean").await.unwrap().unwrap();
    assert_eq!(clean.value, Value::Bool(false));
    assert!(clean.ack);
}

#[tokio::test]
async fn writing_false_to_a_button_is_forced_back() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(&server, &bus, true).await;

    engine
        .handle_event(&write("robovac.Botty.commands.clean", Value::Bool(false)))
        .await;

    assert_eq!(count_cmd(&server, "startCleaning").await, 0);
    let clean = bus.get_state("robovac.Botty.commands.clean").await.unwrap().unwrap();
    assert_eq!(clean.value, Value::Bool(false));
    assert!(clean.ack);
}

#[tokio::test]
async fn non_ok_result_reverts_button() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(&server, &bus, true).await;
    mount_message(&server, "startCleaning", json!({"result": "not_on_charge_base"})).await;

    engine
        .handle_event(&write("robovac.Botty.commands.clean", Value::Bool(true)))
        .await;

    let clean = bus.get_state("robovac.Botty.commands.clean").await.unwrap().unwrap();
    assert_eq!(clean.value, Value::Bool(false));
}

#[tokio::test]
async fn eco_is_stored_locally_and_shapes_the_next_run() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(&server, &bus, true).await;
    mount_message(&server, "startCleaning", json!({"result": "ok"})).await;

    engine
        .handle_event(&write("robovac.Botty.commands.eco", Value::Bool(true)))
        .await;
    // no remote traffic for the property itself, just an acked echo
    assert_eq!(count_cmd(&server, "eco").await, 0);
    let eco = bus.get_state("robovac.Botty.commands.eco").await.unwrap().unwrap();
    assert_eq!(eco.value, Value::Bool(true));
    assert!(eco.ack);

    engine
        .handle_event(&write("robovac.Botty.commands.clean", Value::Bool(true)))
        .await;
    let requests = server.received_requests().await.unwrap();
    let body = requests
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).to_string())
        .find(|b| b.contains("startCleaning"))
        .unwrap();
    assert!(body.contains("\"mode\":1"), "eco run should use mode 1: {body}");
}

#[tokio::test]
async fn spot_parameters_shape_spot_cleaning() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(&server, &bus, true).await;
    mount_message(&server, "startSpotCleaning", json!({"result": "ok"})).await;

    engine
        .handle_event(&write("robovac.Botty.commands.spotWidth", Value::Num(200.0)))
        .await;
    engine
        .handle_event(&write("robovac.Botty.commands.spotRepeat", Value::Bool(true)))
        .await;
    engine
        .handle_event(&write("robovac.Botty.commands.cleanSpot", Value::Bool(true)))
        .await;

    let requests = server.received_requests().await.unwrap();
    let body = requests
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).to_string())
        .find(|b| b.contains("startSpotCleaning"))
        .unwrap();
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["params"]["spotWidth"], 200);
    assert_eq!(body["params"]["spotHeight"], 100);
    assert_eq!(body["params"]["modifier"], 2);
}

#[tokio::test]
async fn schedule_switch_failure_reverts_to_previous_value() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(&server, &bus, true).await;
    mount_message(&server, "disableSchedule", json!({"result": "ko"})).await;

    // the mirror says the schedule is currently enabled
    let before = bus.get_state("robovac.Botty.commands.schedule").await.unwrap().unwrap();
    assert_eq!(before.value, Value::Bool(true));

    engine
        .handle_event(&write("robovac.Botty.commands.schedule", Value::Bool(false)))
        .await;

    let after = bus.get_state("robovac.Botty.commands.schedule").await.unwrap().unwrap();
    assert_eq!(after.value, Value::Bool(true), "failed disable must not flip the switch");
}

#[tokio::test]
async fn schedule_switch_success_is_acked() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(&server, &bus, true).await;
    mount_message(&server, "disableSchedule", json!({"result": "ok"})).await;

    engine
        .handle_event(&write("robovac.Botty.commands.schedule", Value::Bool(false)))
        .await;

    let after = bus.get_state("robovac.Botty.commands.schedule").await.unwrap().unwrap();
    assert_eq!(after.value, Value::Bool(false));
    assert!(after.ack);
}

#[tokio::test]
async fn writes_before_ready_are_ignored() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = SyncEngine::builder(server.uri())
        .credentials("user@example.com", "secret")
        .build(bus.clone());

    engine
        .handle_event(&write("robovac.Botty.commands.clean", Value::Bool(true)))
        .await;

    assert!(server.received_requests().await.unwrap().is_empty());
    assert!(bus.get_state("robovac.Botty.commands.clean").await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_device_and_channel_are_ignored() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(&server, &bus, true).await;
    let requests_before = server.received_requests().await.unwrap().len();

    engine
        .handle_event(&write("robovac.Ghost.commands.clean", Value::Bool(true)))
        .await;
    engine
        .handle_event(&write("robovac.Botty.mystery.clean", Value::Bool(true)))
        .await;
    // acked echoes are status, not commands
    engine.handle_event(&StateEvent {
        path: "robovac.Botty.commands.clean".to_string(),
        value: Value::Bool(true),
        ack: true,
    })
    .await;

    assert_eq!(server.received_requests().await.unwrap().len(), requests_before);
}

#[tokio::test]
async fn unknown_command_changes_nothing() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(&server, &bus, true).await;
    let requests_before = server.received_requests().await.unwrap().len();

    engine
        .handle_event(&write("robovac.Botty.commands.selfDestruct", Value::Bool(true)))
        .await;

    assert_eq!(server.received_requests().await.unwrap().len(), requests_before);
    assert!(bus.get_state("robovac.Botty.commands.selfDestruct").await.unwrap().is_none());
}
