use serde_json::{json, Value};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::logger::TrafficLogger;
use crate::types::{RobotInfo, RobotState, Schedule, ScheduleEvent, SpotParams};
use crate::{Error, Result};

/// HTTP client for the vendor cloud: session authentication, robot listing
/// and a per-robot message endpoint carrying `{reqId, cmd, params}`.
pub struct CloudClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    logger: Option<TrafficLogger>,
}

impl CloudClient {
    pub(crate) fn new(http: reqwest::Client, base_url: String, logger: Option<TrafficLogger>) -> Self {
        Self { http, base_url, token: None, logger }
    }

    pub async fn authenticate(&mut self, email: &str, secret: &str) -> Result<()> {
        let url = format!("{}/sessions", self.base_url);
        debug!(url = %url, "authenticating against cloud");
        if let Some(ref mut logger) = self.logger {
            logger.log_http("POST", "/sessions");
        }

        let body: Value = self
            .http
            .post(&url)
            .json(&json!({ "email": email, "token": secret }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Protocol("session response carries no access_token".to_string()))?;
        self.token = Some(token.to_string());
        Ok(())
    }

    pub async fn list_robots(&mut self) -> Result<Vec<RobotInfo>> {
        let token = self.token.clone().ok_or(Error::NotAuthenticated)?;
        let url = format!("{}/users/me/robots", self.base_url);
        debug!(url = %url, "listing robots");
        if let Some(ref mut logger) = self.logger {
            logger.log_http("GET", "/users/me/robots");
        }

        let robots: Vec<RobotInfo> = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(robots)
    }

    async fn message(&mut self, serial: &str, cmd: &str, params: Value, mutating: bool) -> Result<Value> {
        let token = self.token.clone().ok_or(Error::NotAuthenticated)?;
        if let Some(ref mut logger) = self.logger {
            logger.log_message(serial, cmd, &params, mutating);
        }

        let msg = json!({
            "reqId": Uuid::new_v4().to_string(),
            "cmd": cmd,
            "params": params,
        });
        let url = format!("{}/robots/{}/messages", self.base_url, serial);
        trace!(serial, cmd, "sending robot message");

        let body: Value = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&msg)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }

    pub async fn get_state(&mut self, serial: &str) -> Result<RobotState> {
        let body = self.message(serial, "getRobotState", json!({}), false).await?;
        serde_json::from_value(body)
            .map_err(|e| Error::Protocol(format!("bad getRobotState payload: {e}")))
    }

    /// Fetch the full weekly schedule. The client keeps no schedule cache,
    /// so every call reflects out-of-band edits.
    pub async fn get_schedule(&mut self, serial: &str) -> Result<Schedule> {
        let body = self.message(serial, "getSchedule", json!({}), false).await?;
        check_ok("getSchedule", &body)?;
        let data = body
            .get("data")
            .cloned()
            .ok_or_else(|| Error::Protocol("getSchedule response carries no data".to_string()))?;
        serde_json::from_value(data)
            .map_err(|e| Error::Protocol(format!("bad getSchedule payload: {e}")))
    }

    /// Write the whole weekly schedule back in one call.
    pub async fn set_schedule(&mut self, serial: &str, events: &[ScheduleEvent]) -> Result<()> {
        let body = self
            .message(serial, "setSchedule", json!({ "events": events }), true)
            .await?;
        check_ok("setSchedule", &body)
    }

    async fn action(&mut self, serial: &str, cmd: &str, params: Value) -> Result<String> {
        let body = self.message(serial, cmd, params, true).await?;
        Ok(body
            .get("result")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    pub async fn start_cleaning(
        &mut self,
        serial: &str,
        category: i64,
        mode: i64,
        modifier: i64,
    ) -> Result<String> {
        self.action(
            serial,
            "startCleaning",
            json!({ "category": category, "mode": mode, "modifier": modifier }),
        )
        .await
    }

    pub async fn start_spot_cleaning(&mut self, serial: &str, params: &SpotParams) -> Result<String> {
        self.action(
            serial,
            "startSpotCleaning",
            json!({
                "category": 3,
                "mode": params.mode,
                "modifier": params.modifier,
                "spotWidth": params.width,
                "spotHeight": params.height,
            }),
        )
        .await
    }

    pub async fn pause_cleaning(&mut self, serial: &str) -> Result<String> {
        self.action(serial, "pauseCleaning", json!({})).await
    }

    pub async fn resume_cleaning(&mut self, serial: &str) -> Result<String> {
        self.action(serial, "resumeCleaning", json!({})).await
    }

    pub async fn stop_cleaning(&mut self, serial: &str) -> Result<String> {
        self.action(serial, "stopCleaning", json!({})).await
    }

    pub async fn send_to_base(&mut self, serial: &str) -> Result<String> {
        self.action(serial, "sendToBase", json!({})).await
    }

    pub async fn enable_schedule(&mut self, serial: &str) -> Result<String> {
        self.action(serial, "enableSchedule", json!({})).await
    }

    pub async fn disable_schedule(&mut self, serial: &str) -> Result<String> {
        self.action(serial, "disableSchedule", json!({})).await
    }
}

fn check_ok(cmd: &str, body: &Value) -> Result<()> {
    let result = body.get("result").and_then(|v| v.as_str()).unwrap_or_default();
    if result == "ok" {
        Ok(())
    } else {
        Err(Error::Cloud { cmd: cmd.to_string(), result: result.to_string() })
    }
}
