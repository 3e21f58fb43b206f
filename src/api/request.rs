//! Request execution: one API call with retry, backoff, and
//! classification.
//!
//! A [`Request`] couples a [`ParamSet`] with its site, an upload flag,
//! and a retry budget. `submit()` runs the attempt loop: consult the
//! throttle, issue one HTTP POST, decode the payload, then classify the
//! outcome. Transient failures back off and retry; `maxlag` informs the
//! throttle without consuming the budget; session loss triggers
//! re-authentication and a bounded replay; everything else surfaces as a
//! typed error.

use crate::api::{ApiError, ApiResult, ParamSet};
use crate::config::{next_retry_wait, MAX_LOGIN_REPLAYS};
use crate::login::{LoginStatus, LoginTier};
use crate::shutdown::sleep_or_shutdown;
use crate::site::Site;
use crate::transport::{TransportError, WireRequest};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lag report embedded in a `maxlag` error's info text.
static LAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Waiting for [^ ]+: ([\d.]+) seconds? lagged").expect("valid regex"));

/// Extract the lag seconds from a `maxlag` error info string.
fn parse_lag(info: &str) -> Option<u64> {
    let captures = LAG_PATTERN.captures(info)?;
    let lag: f64 = captures.get(1)?.as_str().parse().ok()?;
    Some(lag.ceil() as u64)
}

/// Split a server error object into (code, info, remaining fields),
/// renaming the `*` help-text field to `help`.
fn split_error_object(error: &Map<String, Value>) -> (String, String, Map<String, Value>) {
    let mut extra = error.clone();
    if let Some(help) = extra.remove("*") {
        extra.insert("help".to_string(), help);
    }
    let code = extra
        .remove("code")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "Unknown".to_string());
    let info = extra
        .remove("info")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    (code, info, extra)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A single API request with its retry state.
pub struct Request {
    site: Arc<Site>,
    params: ParamSet,
    mime: bool,
    max_retries: u32,
    retry_wait: Duration,
    session_recovery: bool,
}

impl Request {
    /// Create a request; retry budget and initial wait come from the
    /// site configuration.
    pub fn new(site: Arc<Site>, params: ParamSet) -> Self {
        let max_retries = site.config().max_retries;
        let retry_wait = site.config().retry_wait;
        Self {
            site,
            params,
            mime: false,
            max_retries,
            retry_wait,
            session_recovery: true,
        }
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the initial backoff wait.
    pub fn with_retry_wait(mut self, retry_wait: Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }

    /// Send the body as `multipart/form-data`; the `file` parameter is
    /// then treated as a local path to upload.
    pub fn with_upload(mut self) -> Self {
        self.mime = true;
        self
    }

    /// Enable or disable automatic re-login on session loss. Disabled
    /// for the requests the login path itself issues.
    pub fn with_session_recovery(mut self, enabled: bool) -> Self {
        self.session_recovery = enabled;
        self
    }

    /// The request parameters.
    pub fn params(&self) -> &ParamSet {
        &self.params
    }

    /// Mutable access to the parameters (continuation merging).
    pub fn params_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }

    /// The site this request targets.
    pub fn site(&self) -> &Arc<Site> {
        &self.site
    }

    /// Synthetic payload for actions blocked in simulation mode.
    fn simulate(&self, action: &str) -> Option<Value> {
        let config = self.site.config();
        if !config.simulate || !config.blocked_actions.iter().any(|a| a == action) {
            return None;
        }
        info!(action, "SIMULATION: action blocked");
        let mut body = Map::new();
        body.insert(
            "result".to_string(),
            Value::String("Success".to_string()),
        );
        body.insert("nochange".to_string(), Value::String(String::new()));
        let mut payload = Map::new();
        payload.insert(action.to_string(), Value::Object(body));
        Some(Value::Object(payload))
    }

    /// Consume one unit of the retry budget and sleep the current wait,
    /// doubling it afterwards up to the ceiling.
    async fn wait_for_retry(
        &self,
        retries_left: &mut u32,
        retry_wait: &mut Duration,
    ) -> ApiResult<()> {
        if *retries_left == 0 {
            return Err(ApiError::Timeout);
        }
        *retries_left -= 1;
        warn!(
            wait_secs = retry_wait.as_secs_f64(),
            retries_left = *retries_left,
            "Waiting before retrying"
        );
        if !sleep_or_shutdown(*retry_wait, self.site.shutdown()).await {
            return Err(ApiError::Cancelled);
        }
        *retry_wait = next_retry_wait(*retry_wait);
        Ok(())
    }

    /// Submit the request and return the decoded payload.
    ///
    /// The retry budget and backoff wait reset on every call; session
    /// recovery replays are counted separately and capped.
    pub async fn submit(&mut self) -> ApiResult<Value> {
        self.params.normalize(self.site.config().maxlag)?;
        let mut retries_left = self.max_retries;
        let mut retry_wait = self.retry_wait;
        let mut login_replays: u32 = 0;

        loop {
            if let Some(shutdown) = self.site.shutdown() {
                if shutdown.is_shutdown_requested() {
                    return Err(ApiError::Cancelled);
                }
            }
            let action = self.params.action().to_string();

            if let Some(simulated) = self.simulate(&action) {
                return Ok(simulated);
            }

            if !self
                .site
                .throttle()
                .wait_for_turn(self.params.is_write(), self.site.shutdown())
                .await
            {
                return Err(ApiError::Cancelled);
            }

            let secure = self.site.use_secure(&action);
            let url = self.site.script_url(secure)?;
            let (headers, body) = if self.mime {
                let (content_type, body) = self.params.to_multipart()?;
                (vec![("Content-Type".to_string(), content_type)], body)
            } else {
                (
                    vec![(
                        "Content-Type".to_string(),
                        "application/x-www-form-urlencoded".to_string(),
                    )],
                    self.params.to_urlencoded().into_bytes(),
                )
            };

            let raw = match self
                .site
                .transport()
                .send(WireRequest {
                    url: url.clone(),
                    headers,
                    body,
                })
                .await
            {
                Ok(raw) => raw,
                Err(TransportError::Gateway(e)) => {
                    warn!(error = %e, "Gateway error; retrying");
                    self.wait_for_retry(&mut retries_left, &mut retry_wait)
                        .await?;
                    continue;
                }
                Err(TransportError::Fatal(e)) => {
                    error!(error = %e, url = %url, "Fatal transport error");
                    return Err(ApiError::FatalTransport(e));
                }
                Err(TransportError::Network(e)) => {
                    error!(error = %e, url = %url, "Transport error; retrying");
                    self.wait_for_retry(&mut retries_left, &mut retry_wait)
                        .await?;
                    continue;
                }
            };

            if let Some(rest) = raw.strip_prefix("unknown_action") {
                return Err(ApiError::Api {
                    code: "unknown_action".to_string(),
                    info: rest.trim_start_matches([':', ' ']).to_string(),
                    extra: Map::new(),
                });
            }

            let result: Value = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(_) => {
                    warn!(
                        site = %self.site.canonical_id(),
                        "Non-JSON response received; the server may be down"
                    );
                    // The response may also have overflowed; ask for less.
                    let halved = self.params.halve_limits();
                    if !halved.is_empty() {
                        debug!(params = ?halved, "Halved limit parameters");
                    }
                    self.wait_for_retry(&mut retries_left, &mut retry_wait)
                        .await?;
                    continue;
                }
            };

            if result.is_null() {
                return Ok(Value::Object(Map::new()));
            }
            let Some(result_obj) = result.as_object() else {
                return Err(ApiError::InvalidResponse(format!(
                    "unable to process query response of type {}",
                    json_type_name(&result)
                )));
            };

            let error_obj = result_obj.get("error").and_then(|v| v.as_object());

            if action == "query" {
                if let Some(userinfo) = result_obj
                    .get("query")
                    .and_then(|q| q.get("userinfo"))
                    .and_then(|u| u.as_object())
                {
                    let userinfo = userinfo.clone();
                    self.site
                        .with_state(|state| state.user_info = Some(userinfo))
                        .await;
                }

                if self.session_recovery {
                    let lost_tier = self
                        .site
                        .with_state(|state| {
                            let rights_limited = error_obj
                                .and_then(|e| e.get("code"))
                                .and_then(|c| c.as_str())
                                .map(|c| c.ends_with("limit"))
                                .unwrap_or(false);
                            let prior_tier = state.login_status.tier();
                            let identity_mismatch = match prior_tier {
                                Some(tier) => {
                                    let expected = state.usernames[tier.index()].as_deref();
                                    let actual = state
                                        .user_info
                                        .as_ref()
                                        .and_then(|i| i.get("name"))
                                        .and_then(|v| v.as_str());
                                    expected.is_some() && actual != expected
                                }
                                None => false,
                            };
                            if rights_limited || identity_mismatch {
                                // session expired: reset identity, force
                                // re-login at the previously held tier
                                state.user_info = None;
                                state.login_status = LoginStatus::NotLoggedIn;
                                Some(prior_tier.unwrap_or(LoginTier::User))
                            } else {
                                None
                            }
                        })
                        .await;

                    if let Some(tier) = lost_tier {
                        if login_replays >= MAX_LOGIN_REPLAYS {
                            if let Some(e) = error_obj {
                                let (code, info, extra) = split_error_object(e);
                                return Err(ApiError::Api { code, info, extra });
                            }
                            return Err(ApiError::SessionExpired {
                                attempts: login_replays,
                            });
                        }
                        login_replays += 1;
                        info!(
                            site = %self.site.canonical_id(),
                            replay = login_replays,
                            "Session lost; re-authenticating and replaying request"
                        );
                        Box::pin(self.site.login(tier)).await?;
                        continue;
                    }
                }
            }

            if let Some(warnings) = result_obj.get("warnings").and_then(|v| v.as_object()) {
                for (module, payload) in warnings {
                    if module == "info" {
                        continue;
                    }
                    let text = payload
                        .get("*")
                        .or_else(|| payload.get("html").and_then(|h| h.get("*")))
                        .and_then(|v| v.as_str());
                    if let Some(text) = text {
                        warn!(module = %module, "API warning: {text}");
                    }
                }
            }

            let Some(error_obj) = error_obj else {
                return Ok(result);
            };

            let (code, info, extra) = split_error_object(error_obj);

            if code == "maxlag" {
                if let Some(lag) = parse_lag(&info) {
                    info!(lag_seconds = lag, "Pausing due to database lag: {info}");
                    self.site.throttle().lag(lag).await;
                    // lag throttling does not consume the retry budget
                    continue;
                }
            }

            if code.starts_with("internal_api_error_") {
                warn!(code = %code, "Internal server error; retrying");
                self.wait_for_retry(&mut retries_left, &mut retry_wait)
                    .await?;
                continue;
            }

            // known benign race on entity creation
            if code == "failed-save" && action == "wbeditentity" {
                let message = extra
                    .get("messages")
                    .and_then(|m| m.get("0"))
                    .and_then(|m| m.get("name"))
                    .and_then(|v| v.as_str());
                if message == Some("edit-already-exists") {
                    warn!("Save conflict (edit-already-exists); retrying");
                    self.wait_for_retry(&mut retries_left, &mut retry_wait)
                        .await?;
                    continue;
                }
            }

            warn!(code = %code, info = %info, query = %self.params, "API error response");
            return Err(ApiError::Api { code, info, extra });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_lag() {
        assert_eq!(
            parse_lag("Waiting for 10.64.16.7: 3 seconds lagged"),
            Some(3)
        );
        assert_eq!(
            parse_lag("Waiting for db1042: 1 second lagged"),
            Some(1)
        );
        assert_eq!(
            parse_lag("Waiting for 10.64.16.7: 2.4 seconds lagged"),
            Some(3)
        );
        assert_eq!(parse_lag("some other error text"), None);
    }

    #[test]
    fn test_split_error_renames_star_to_help() {
        let error = json!({
            "code": "badtoken",
            "info": "Invalid token",
            "*": "See the API documentation",
            "detail": 7
        });
        let (code, info, extra) = split_error_object(error.as_object().unwrap());
        assert_eq!(code, "badtoken");
        assert_eq!(info, "Invalid token");
        assert_eq!(
            extra.get("help").and_then(|v| v.as_str()),
            Some("See the API documentation")
        );
        assert!(!extra.contains_key("*"));
        assert_eq!(extra.get("detail"), Some(&json!(7)));
    }

    #[test]
    fn test_split_error_defaults_unknown_code() {
        let error = json!({ "info": "something odd" });
        let (code, info, _) = split_error_object(error.as_object().unwrap());
        assert_eq!(code, "Unknown");
        assert_eq!(info, "something odd");
    }

    #[test]
    fn test_json_type_name() {
        assert_eq!(json_type_name(&json!([1, 2])), "array");
        assert_eq!(json_type_name(&json!("x")), "string");
    }
}
