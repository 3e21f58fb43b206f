//! Engine behavior tests against a scripted transport: retry
//! classification, continuation walking, session recovery, simulation,
//! and the response cache.

use async_trait::async_trait;
use mwapi_client::api::{ApiError, CachedRequest, ParamSet, QueryCursor, Request};
use mwapi_client::config::{ApiConfig, MAX_LOGIN_REPLAYS};
use mwapi_client::login::{LoginStatus, LoginTier};
use mwapi_client::site::{Family, Site};
use mwapi_client::transport::{Transport, TransportError, WireRequest};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Transport that serves a fixed sequence of responses and records
/// every request body it sees.
struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<String, TransportError>>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn new(responses: Vec<Result<String, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn count_matching(&self, needle: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|body| body.contains(needle))
            .count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: WireRequest) -> Result<String, TransportError> {
        let body = String::from_utf8_lossy(&request.body).to_string();
        self.requests.lock().unwrap().push(body);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("no scripted response".to_string())))
    }
}

/// Transport that routes by request body content; the first route whose
/// needle occurs in the body wins. Serves unlimited repeats.
struct RoutedTransport {
    routes: Vec<(&'static str, String)>,
    requests: Mutex<Vec<String>>,
}

impl RoutedTransport {
    fn new(routes: Vec<(&'static str, String)>) -> Arc<Self> {
        Arc::new(Self {
            routes,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn count_matching(&self, needle: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|body| body.contains(needle))
            .count()
    }
}

#[async_trait]
impl Transport for RoutedTransport {
    async fn send(&self, request: WireRequest) -> Result<String, TransportError> {
        let body = String::from_utf8_lossy(&request.body).to_string();
        self.requests.lock().unwrap().push(body.clone());
        for (needle, response) in &self.routes {
            if body.contains(needle) {
                return Ok(response.clone());
            }
        }
        Err(TransportError::Network(format!("no route for: {body}")))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn test_family() -> Arc<Family> {
    Arc::new(Family::new("testwiki").with_host("en", "test.example.org"))
}

fn test_config(cache: &tempfile::TempDir) -> ApiConfig {
    ApiConfig::default()
        .with_max_retries(2)
        .with_retry_wait(Duration::from_millis(10))
        .with_cache_dir(cache.path())
        .with_throttle(Duration::ZERO, Duration::ZERO, Duration::from_secs(60))
}

fn make_site(transport: Arc<dyn Transport>, config: ApiConfig) -> Arc<Site> {
    Site::new(test_family(), "en", Arc::new(config), transport).shared()
}

fn backlinks_params() -> ParamSet {
    ParamSet::from_pairs([("action", "query"), ("list", "backlinks")]).unwrap()
}

fn backlinks_page(titles: &[&str], continue_token: Option<&str>) -> String {
    let items: Vec<Value> = titles.iter().map(|t| json!({ "title": t })).collect();
    let mut response = json!({ "query": { "backlinks": items } });
    if let Some(token) = continue_token {
        response["query-continue"] = json!({ "backlinks": { "blcontinue": token } });
    }
    response.to_string()
}

fn paraminfo_response(module: &str, prefix: &str) -> String {
    json!({
        "paraminfo": {
            "querymodules": [{
                "name": module,
                "prefix": prefix,
                "parameters": [{ "name": "limit", "max": 500, "highmax": 5000 }]
            }]
        }
    })
    .to_string()
}

async fn mark_logged_in(site: &Arc<Site>) {
    site.with_state(|state| {
        state.login_status = LoginStatus::AsUser;
        state.user_info = Some(
            json!({ "name": "Bot", "groups": ["user"], "rights": ["read"] })
                .as_object()
                .unwrap()
                .clone(),
        );
    })
    .await;
}

#[test]
fn test_missing_action_fails_before_any_network() {
    let result = ParamSet::from_pairs([("list", "backlinks")]);
    assert!(result.is_err());
}

#[tokio::test]
async fn test_maxlag_retried_without_consuming_budget() {
    let maxlag_error = json!({
        "error": {
            "code": "maxlag",
            "info": "Waiting for 10.64.16.7: 2 seconds lagged"
        }
    })
    .to_string();
    let transport = ScriptedTransport::new(vec![
        Ok(maxlag_error),
        Ok(backlinks_page(&["A"], None)),
    ]);
    let cache = tempfile::tempdir().unwrap();
    // zero retry budget: any backoff retry would fail with Timeout
    let config = test_config(&cache).with_max_retries(0);
    let site = make_site(transport.clone(), config);

    let mut request = Request::new(site, backlinks_params());
    let result = request.submit().await.unwrap();
    assert!(result["query"]["backlinks"].is_array());
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_retry_budget_exhaustion_raises_timeout() {
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::Network("connection reset".to_string())),
        Err(TransportError::Network("connection reset".to_string())),
        Err(TransportError::Network("connection reset".to_string())),
    ]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let start = Instant::now();
    let mut request = Request::new(site, backlinks_params());
    let result = request.submit().await;
    assert!(matches!(result, Err(ApiError::Timeout)));
    // budget of 2: one attempt plus two retries
    assert_eq!(transport.call_count(), 3);
    // waits double: 10ms then 20ms
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn test_gateway_error_retried() {
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::Gateway("503 Service Unavailable".to_string())),
        Ok(backlinks_page(&["A"], None)),
    ]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let mut request = Request::new(site, backlinks_params());
    assert!(request.submit().await.is_ok());
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_fatal_transport_error_not_retried() {
    let transport = ScriptedTransport::new(vec![Err(TransportError::Fatal(
        "invalid TLS certificate".to_string(),
    ))]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let mut request = Request::new(site, backlinks_params());
    let result = request.submit().await;
    assert!(matches!(result, Err(ApiError::FatalTransport(_))));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_unknown_action_raw_prefix() {
    let transport =
        ScriptedTransport::new(vec![Ok("unknown_action: whatsthis".to_string())]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let params = ParamSet::from_pairs([("action", "query"), ("meta", "siteinfo")]).unwrap();
    let mut request = Request::new(site, params);
    let result = request.submit().await;
    match result {
        Err(ApiError::Api { code, .. }) => assert_eq!(code, "unknown_action"),
        other => panic!("expected unknown_action error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_decode_failure_halves_limits_and_retries() {
    let transport = ScriptedTransport::new(vec![
        Ok("<html>502 Bad Gateway</html>".to_string()),
        Ok(backlinks_page(&["A"], None)),
    ]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let params = ParamSet::from_pairs([
        ("action", "query"),
        ("list", "backlinks"),
        ("bllimit", "500"),
    ])
    .unwrap();
    let mut request = Request::new(site, params);
    assert!(request.submit().await.is_ok());
    assert_eq!(transport.call_count(), 2);
    assert_eq!(request.params().get_joined("bllimit").as_deref(), Some("250"));
}

#[tokio::test]
async fn test_internal_api_error_retried() {
    let internal = json!({
        "error": { "code": "internal_api_error_DBQueryError", "info": "boom" }
    })
    .to_string();
    let transport = ScriptedTransport::new(vec![
        Ok(internal),
        Ok(backlinks_page(&["A"], None)),
    ]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let mut request = Request::new(site, backlinks_params());
    assert!(request.submit().await.is_ok());
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_structured_error_surfaces_with_extra_fields() {
    let error = json!({
        "error": {
            "code": "badtoken",
            "info": "Invalid token",
            "*": "See API help"
        }
    })
    .to_string();
    let transport = ScriptedTransport::new(vec![Ok(error)]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let params = ParamSet::from_pairs([("action", "purge"), ("titles", "X")]).unwrap();
    let mut request = Request::new(site, params);
    match request.submit().await {
        Err(ApiError::Api { code, info, extra }) => {
            assert_eq!(code, "badtoken");
            assert_eq!(info, "Invalid token");
            assert_eq!(extra.get("help").and_then(|v| v.as_str()), Some("See API help"));
        }
        other => panic!("expected structured API error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_continuation_walks_three_pages_in_order() {
    init_tracing();
    let transport = ScriptedTransport::new(vec![
        Ok(paraminfo_response("backlinks", "bl")),
        Ok(backlinks_page(&["A1", "A2"], Some("tokenA"))),
        Ok(backlinks_page(&["B1", "B2"], Some("tokenB"))),
        Ok(backlinks_page(&["C1"], None)),
    ]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let mut cursor = QueryCursor::new(Request::new(site, backlinks_params())).unwrap();
    let mut titles = Vec::new();
    while let Some(item) = cursor.next_item().await.unwrap() {
        titles.push(item["title"].as_str().unwrap().to_string());
    }
    assert_eq!(titles, vec!["A1", "A2", "B1", "B2", "C1"]);
    assert_eq!(transport.count_matching("action=query"), 3);
    assert_eq!(transport.count_matching("action=paraminfo"), 1);
}

#[tokio::test]
async fn test_item_cap_stops_after_third_page() {
    let transport = ScriptedTransport::new(vec![
        Ok(paraminfo_response("backlinks", "bl")),
        Ok(backlinks_page(&["A1", "A2"], Some("tokenA"))),
        Ok(backlinks_page(&["B1", "B2"], Some("tokenB"))),
        Ok(backlinks_page(&["C1", "C2"], Some("tokenC"))),
    ]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let mut cursor = QueryCursor::new(Request::new(site, backlinks_params())).unwrap();
    cursor.set_maximum_items(5);
    let mut yielded = 0;
    while let Some(_item) = cursor.next_item().await.unwrap() {
        yielded += 1;
    }
    assert_eq!(yielded, 5);
    assert_eq!(transport.count_matching("action=query"), 3);
}

#[tokio::test]
async fn test_unknown_module_rejected_at_discovery() {
    let missing = json!({
        "paraminfo": {
            "querymodules": [{ "name": "nosuchmodule", "missing": "" }]
        }
    })
    .to_string();
    let transport = ScriptedTransport::new(vec![Ok(missing)]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let params = ParamSet::from_pairs([("action", "query"), ("list", "nosuchmodule")]).unwrap();
    let mut cursor = QueryCursor::new(Request::new(site, params)).unwrap();
    let result = cursor.next_item().await;
    assert!(matches!(result, Err(ApiError::InvalidModule(_))));
}

#[tokio::test]
async fn test_session_loss_triggers_relogin_and_replay() {
    init_tracing();
    let rights_error = json!({
        "error": { "code": "bllimit", "info": "Too many values" }
    })
    .to_string();
    let anon_userinfo = json!({
        "query": { "userinfo": { "name": "", "anon": "", "groups": [], "rights": [] } }
    })
    .to_string();
    let login_success = json!({
        "login": { "result": "Success", "lgusername": "Bot" }
    })
    .to_string();
    let bot_userinfo = json!({
        "query": { "userinfo": { "name": "Bot", "groups": ["user"], "rights": ["read"] } }
    })
    .to_string();
    let transport = ScriptedTransport::new(vec![
        Ok(rights_error),
        Ok(anon_userinfo),
        Ok(login_success),
        Ok(bot_userinfo),
        Ok(backlinks_page(&["A"], None)),
    ]);
    let cache = tempfile::tempdir().unwrap();
    let site = Site::new(
        test_family(),
        "en",
        Arc::new(test_config(&cache)),
        transport.clone(),
    )
    .with_credentials(LoginTier::User, "Bot", "secret")
    .shared();
    mark_logged_in(&site).await;

    let mut request = Request::new(site.clone(), backlinks_params());
    let result = request.submit().await.unwrap();
    assert!(result["query"]["backlinks"].is_array());
    assert_eq!(transport.call_count(), 5);
    assert_eq!(transport.count_matching("action=login"), 1);
    assert_eq!(site.login_status().await, LoginStatus::AsUser);
}

#[tokio::test]
async fn test_replay_cap_surfaces_server_error() {
    // every backlinks query fails with a rights-limit error; the probe
    // always reports a valid session, so each replay cycle re-validates
    // and fails again until the cap trips
    let rights_error = json!({
        "error": { "code": "bllimit", "info": "Too many values" }
    })
    .to_string();
    let bot_userinfo = json!({
        "query": { "userinfo": { "name": "Bot", "groups": ["user"], "rights": ["read"] } }
    })
    .to_string();
    let transport = RoutedTransport::new(vec![
        ("list=backlinks", rights_error),
        ("meta=userinfo", bot_userinfo),
    ]);
    let cache = tempfile::tempdir().unwrap();
    let site = Site::new(
        test_family(),
        "en",
        Arc::new(test_config(&cache)),
        transport.clone(),
    )
    .with_credentials(LoginTier::User, "Bot", "secret")
    .shared();
    mark_logged_in(&site).await;

    let mut request = Request::new(site, backlinks_params());
    match request.submit().await {
        Err(ApiError::Api { code, .. }) => assert_eq!(code, "bllimit"),
        other => panic!("expected surfaced API error, got {other:?}"),
    }
    // one initial attempt plus one replay per allowed re-login
    assert_eq!(
        transport.count_matching("list=backlinks"),
        1 + MAX_LOGIN_REPLAYS as usize
    );
}

#[tokio::test]
async fn test_throttled_login_refused_without_network_until_deadline() {
    let anon_userinfo = json!({
        "query": { "userinfo": { "name": "", "anon": "", "groups": [], "rights": [] } }
    })
    .to_string();
    let throttled = json!({
        "login": { "result": "Throttled", "wait": 60 }
    })
    .to_string();
    let transport = ScriptedTransport::new(vec![Ok(anon_userinfo), Ok(throttled)]);
    let cache = tempfile::tempdir().unwrap();
    let site = Site::new(
        test_family(),
        "en",
        Arc::new(test_config(&cache)),
        transport.clone(),
    )
    .with_credentials(LoginTier::User, "Bot", "secret")
    .shared();

    // identity query plus the throttled credential exchange
    let first = site.login(LoginTier::User).await;
    assert!(matches!(first, Err(ApiError::LoginThrottled { .. })));
    assert_eq!(transport.call_count(), 2);

    // the recorded deadline refuses the retry before anything goes out
    let second = site.login(LoginTier::User).await;
    match second {
        Err(ApiError::LoginThrottled { wait_seconds }) => assert!(wait_seconds >= 1),
        other => panic!("expected throttled login, got {other:?}"),
    }
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_simulation_gate_blocks_write_without_network() {
    let transport = ScriptedTransport::new(vec![]);
    let cache = tempfile::tempdir().unwrap();
    let mut config = test_config(&cache).with_simulate(true);
    config.blocked_actions = vec!["edit".to_string()];
    let site = make_site(transport.clone(), config);

    let params = ParamSet::from_pairs([("action", "edit"), ("title", "X"), ("text", "y")]).unwrap();
    let mut request = Request::new(site, params);
    let result = request.submit().await.unwrap();
    assert_eq!(result["edit"]["result"], "Success");
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn test_cache_hit_issues_single_network_call() {
    let siteinfo = json!({ "query": { "general": { "sitename": "Test" } } }).to_string();
    let transport = ScriptedTransport::new(vec![Ok(siteinfo.clone()), Ok(siteinfo)]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let params = ParamSet::from_pairs([("action", "query"), ("meta", "siteinfo")]).unwrap();
    let mut first = CachedRequest::new(
        Request::new(site.clone(), params.clone()),
        chrono::Duration::days(1),
    );
    let a = first.submit().await.unwrap();

    let mut second = CachedRequest::new(
        Request::new(site.clone(), params),
        chrono::Duration::days(1),
    );
    let b = second.submit().await.unwrap();
    assert_eq!(a, b);
    assert_eq!(transport.call_count(), 1);

    // a different parameter set misses
    let other = ParamSet::from_pairs([
        ("action", "query"),
        ("meta", "siteinfo"),
        ("siprop", "namespaces"),
    ])
    .unwrap();
    let mut third = CachedRequest::new(Request::new(site, other), chrono::Duration::days(1));
    third.submit().await.unwrap();
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_expired_cache_entry_is_a_miss() {
    let siteinfo = json!({ "query": { "general": { "sitename": "Test" } } }).to_string();
    let transport = ScriptedTransport::new(vec![Ok(siteinfo.clone()), Ok(siteinfo)]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let params = ParamSet::from_pairs([("action", "query"), ("meta", "siteinfo")]).unwrap();
    let mut first = CachedRequest::new(
        Request::new(site.clone(), params.clone()),
        chrono::Duration::zero(),
    );
    first.submit().await.unwrap();
    std::thread::sleep(Duration::from_millis(10));

    let mut second =
        CachedRequest::new(Request::new(site, params), chrono::Duration::zero());
    second.submit().await.unwrap();
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_cache_entry_with_foreign_description_is_a_miss() {
    let siteinfo = json!({ "query": { "general": { "sitename": "Test" } } }).to_string();
    let transport = ScriptedTransport::new(vec![Ok(siteinfo.clone()), Ok(siteinfo)]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let params = ParamSet::from_pairs([("action", "query"), ("meta", "siteinfo")]).unwrap();
    let mut first = CachedRequest::new(
        Request::new(site.clone(), params.clone()),
        chrono::Duration::days(1),
    );
    first.submit().await.unwrap();
    assert_eq!(transport.call_count(), 1);

    // rewrite the stored entry as if a different request had hashed to
    // the same file name
    let entry_path = std::fs::read_dir(cache.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_none())
        .expect("one cache entry on disk");
    let mut entry: Value =
        serde_json::from_str(&std::fs::read_to_string(&entry_path).unwrap()).unwrap();
    entry["description"] = json!("someotherwiki:someotherrequest");
    std::fs::write(&entry_path, entry.to_string()).unwrap();

    let mut second = CachedRequest::new(
        Request::new(site, params),
        chrono::Duration::days(1),
    );
    second.submit().await.unwrap();
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_cache_survives_process_restart() {
    let siteinfo = json!({ "query": { "general": { "sitename": "Test" } } }).to_string();
    let cache = tempfile::tempdir().unwrap();
    let params = ParamSet::from_pairs([("action", "query"), ("meta", "siteinfo")]).unwrap();

    let first_transport = ScriptedTransport::new(vec![Ok(siteinfo)]);
    let first_site = make_site(first_transport.clone(), test_config(&cache));
    let mut first = CachedRequest::new(
        Request::new(first_site, params.clone()),
        chrono::Duration::days(1),
    );
    first.submit().await.unwrap();
    assert_eq!(first_transport.call_count(), 1);

    // a fresh site and transport simulate a new process sharing the dir
    let second_transport = ScriptedTransport::new(vec![]);
    let second_site = make_site(second_transport.clone(), test_config(&cache));
    let mut second = CachedRequest::new(
        Request::new(second_site, params),
        chrono::Duration::days(1),
    );
    let result = second.submit().await.unwrap();
    assert_eq!(result["query"]["general"]["sitename"], "Test");
    assert_eq!(second_transport.call_count(), 0);
}

#[tokio::test]
async fn test_typed_stream_deserializes_items() {
    use futures_util::StreamExt;

    #[derive(Debug, serde::Deserialize)]
    struct Backlink {
        title: String,
    }

    let transport = ScriptedTransport::new(vec![
        Ok(paraminfo_response("backlinks", "bl")),
        Ok(backlinks_page(&["A", "B"], None)),
    ]);
    let cache = tempfile::tempdir().unwrap();
    let site = make_site(transport.clone(), test_config(&cache));

    let cursor = QueryCursor::new(Request::new(site, backlinks_params())).unwrap();
    let links: Vec<Backlink> = cursor
        .into_typed_stream::<Backlink>()
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(links.len(), 2);
    assert_eq!(links[0].title, "A");
}
