use std::sync::Arc;
use std::time::Duration;

use robovac_bridge::{Bus, MemoryBus, StateEvent, SyncEngine, Value};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn state_body() -> serde_json::Value {
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
            "start": true, "stop": false, "pause": false, "resume": false, "goToBase": false
        },
        "availableServices": {"schedule": "basic-2"},
        "meta": {"modelName": "BotVac D7", "firmware": "4.5"}
    })
}

fn schedule_body(events: serde_json::Value) -> serde_json::Value {
    json!({"result": "ok", "data": {"enabled": true, "events": events}})
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

async fn started_engine(
    server: &MockServer,
    bus: &Arc<MemoryBus>,
    events: serde_json::Value,
) -> SyncEngine {
    mount_session(server).await;
    mount_message(server, "getRobotState", state_body()).await;
    mount_message(server, "getSchedule", schedule_body(events)).await;
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

async fn sent_schedule(server: &MockServer) -> Option<serde_json::Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).to_string())
        .find(|b| b.contains("setSchedule"))
        .map(|b| serde_json::from_str(&b).unwrap())
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
async fn new_entry_pulls_mirrored_fields_and_sorts() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(
        &server,
        &bus,
        json!([{"day": 5, "startTime": "08:00", "mode": 2, "boundaryId": "zone-b"}]),
    )
    .await;
    mount_message(&server, "setSchedule", json!({"result": "ok"})).await;

    // mirrors for the new day, as a previous out-of-band sync left them
    bus.set_state("robovac.Botty.schedule.3-mode", Value::Num(1.0), true).await.unwrap();
    bus.set_state("robovac.Botty.schedule.3-boundaryId", Value::Str("abc".to_string()), true)
        .await
        .unwrap();

    engine
        .handle_event(&write("robovac.Botty.schedule.3-startTime", Value::Str("14:30".to_string())))
        .await;

    let sent = sent_schedule(&server).await.expect("setSchedule should be called");
    assert_eq!(
        sent["params"]["events"],
        json!([
            {"day": 3, "startTime": "14:30", "mode": 1, "boundaryId": "abc"},
            {"day": 5, "startTime": "08:00", "mode": 2, "boundaryId": "zone-b"}
        ])
    );
    // the enabled flag must not round-trip
    assert!(sent["params"].get("enabled").is_none());
    assert!(sent["params"]["events"][0].get("enabled").is_none());

    let edited = bus.get_state("robovac.Botty.schedule.3-startTime").await.unwrap().unwrap();
    assert_eq!(edited.value, Value::Str("14:30".to_string()));
    assert!(edited.ack);
}

#[tokio::test]
async fn updating_a_day_preserves_its_other_fields() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(
        &server,
        &bus,
        json!([
            {"day": 1, "startTime": "10:00", "mode": 2, "boundaryId": "x"},
            {"day": 4, "startTime": "09:00", "mode": 1, "boundaryId": "y"}
        ]),
    )
    .await;
    mount_message(&server, "setSchedule", json!({"result": "ok"})).await;

    engine
        .handle_event(&write("robovac.Botty.schedule.1-startTime", Value::Str("11:15".to_string())))
        .await;

    let sent = sent_schedule(&server).await.unwrap();
    assert_eq!(
        sent["params"]["events"],
        json!([
            {"day": 1, "startTime": "11:15", "mode": 2, "boundaryId": "x"},
            {"day": 4, "startTime": "09:00", "mode": 1, "boundaryId": "y"}
        ])
    );
}

#[tokio::test]
async fn empty_time_deletes_the_day() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(
        &server,
        &bus,
        json!([
            {"day": 1, "startTime": "10:00", "mode": 2, "boundaryId": "x"},
            {"day": 4, "startTime": "09:00", "mode": 1, "boundaryId": "y"}
        ]),
    )
    .await;
    mount_message(&server, "setSchedule", json!({"result": "ok"})).await;

    engine
        .handle_event(&write("robovac.Botty.schedule.1-startTime", Value::Str(String::new())))
        .await;

    let sent = sent_schedule(&server).await.unwrap();
    assert_eq!(
        sent["params"]["events"],
        json!([{"day": 4, "startTime": "09:00", "mode": 1, "boundaryId": "y"}])
    );
}

#[tokio::test]
async fn deleting_an_absent_day_is_rejected_with_resync() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(&server, &bus, json!([])).await;

    let polls_before = count_cmd(&server, "getRobotState").await;
    engine
        .handle_event(&write("robovac.Botty.schedule.5-startTime", Value::Str(String::new())))
        .await;

    assert_eq!(count_cmd(&server, "setSchedule").await, 0);
    // the rejection triggered a targeted re-sync
    assert!(count_cmd(&server, "getRobotState").await > polls_before);
}

#[tokio::test]
async fn malformed_time_never_reaches_the_cloud() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(
        &server,
        &bus,
        json!([{"day": 5, "startTime": "08:00", "mode": 2, "boundaryId": "zone-b"}]),
    )
    .await;

    let polls_before = count_cmd(&server, "getRobotState").await;
    engine
        .handle_event(&write("robovac.Botty.schedule.5-startTime", Value::Str("25:99".to_string())))
        .await;

    assert_eq!(count_cmd(&server, "setSchedule").await, 0);
    assert!(count_cmd(&server, "getRobotState").await > polls_before);
    // the mirror still shows the device's truth
    let shown = bus.get_state("robovac.Botty.schedule.5-startTime").await.unwrap().unwrap();
    assert_eq!(shown.value, Value::Str("08:00".to_string()));
}

#[tokio::test]
async fn mode_and_boundary_mirrors_are_read_only() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(
        &server,
        &bus,
        json!([{"day": 1, "startTime": "10:00", "mode": 2, "boundaryId": "x"}]),
    )
    .await;

    engine
        .handle_event(&write("robovac.Botty.schedule.1-mode", Value::Num(1.0)))
        .await;
    engine
        .handle_event(&write("robovac.Botty.schedule.1-boundaryId", Value::Str("z".to_string())))
        .await;

    assert_eq!(count_cmd(&server, "setSchedule").await, 0);
}

#[tokio::test]
async fn missing_mode_mirror_aborts_new_entry() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(&server, &bus, json!([])).await;

    // no mirrored 2-mode value exists; the engine cannot build the entry
    engine
        .handle_event(&write("robovac.Botty.schedule.2-startTime", Value::Str("07:45".to_string())))
        .await;

    assert_eq!(count_cmd(&server, "setSchedule").await, 0);
}

#[tokio::test]
async fn write_back_failure_discards_the_edit() {
    let server = MockServer::start().await;
    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut engine = started_engine(
        &server,
        &bus,
        json!([{"day": 1, "startTime": "10:00", "mode": 2, "boundaryId": "x"}]),
    )
    .await;
    mount_message(&server, "setSchedule", json!({"result": "invalid_schedule"})).await;

    engine
        .handle_event(&write("robovac.Botty.schedule.1-startTime", Value::Str("11:15".to_string())))
        .await;

    // the edit is not acked onto the bus; the re-sync restored the mirror
    let shown = bus.get_state("robovac.Botty.schedule.1-startTime").await.unwrap().unwrap();
    assert_eq!(shown.value, Value::Str("10:00".to_string()));
}
