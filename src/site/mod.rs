//! One wiki site: wire policy plus shared session state.
//!
//! A [`Site`] owns everything the engine shares across requests to one
//! endpoint: the family policy, the throttle, the transport handle, and
//! the mutable [`SiteState`] (login status, cached identity, discovered
//! module limits) behind a single lock. Login transitions are serialized
//! by a dedicated per-site lock so at most one authentication attempt is
//! in flight at a time.

pub mod family;

pub use family::{Family, FamilyError, FamilyRegistry};

use crate::api::{ApiError, ApiResult, ParamSet, Request};
use crate::config::ApiConfig;
use crate::login::{LoginManager, LoginStatus, LoginTier};
use crate::shutdown::SharedShutdown;
use crate::throttle::Throttle;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Server-advertised per-module paging metadata.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Parameter-name prefix used by the module (e.g. `bl`).
    pub prefix: String,
    /// Maximum page size for ordinary users.
    pub limit_max: Option<u64>,
    /// Maximum page size for users with the high-limits right.
    pub limit_highmax: Option<u64>,
}

/// Mutable state shared by all requests to one site.
#[derive(Debug, Default)]
pub struct SiteState {
    /// Current authenticated-identity status.
    pub login_status: LoginStatus,
    /// Cached `userinfo` payload from the most recent query.
    pub user_info: Option<Map<String, Value>>,
    /// Expected usernames per privilege tier.
    pub usernames: [Option<String>; 2],
    /// Discovered module limits, cached for the process lifetime.
    pub module_info: HashMap<String, ModuleInfo>,
    /// Server-imposed login throttle deadline.
    pub login_wait_until: Option<DateTime<Utc>>,
}

/// One wiki site instance.
pub struct Site {
    family: Arc<Family>,
    code: String,
    config: Arc<ApiConfig>,
    transport: Arc<dyn Transport>,
    throttle: Throttle,
    shutdown: Option<SharedShutdown>,
    passwords: [Option<String>; 2],
    state: Mutex<SiteState>,
    login_lock: Mutex<()>,
}

impl Site {
    /// Create a site for `code` within `family`.
    pub fn new(
        family: Arc<Family>,
        code: impl Into<String>,
        config: Arc<ApiConfig>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let throttle = Throttle::from_config(&config);
        Self {
            family,
            code: code.into(),
            config,
            transport,
            throttle,
            shutdown: None,
            passwords: [None, None],
            state: Mutex::new(SiteState::default()),
            login_lock: Mutex::new(()),
        }
    }

    /// Configure credentials for a privilege tier.
    pub fn with_credentials(
        mut self,
        tier: LoginTier,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let idx = tier.index();
        self.passwords[idx] = Some(password.into());
        let username = username.into();
        self.state.get_mut().usernames[idx] = Some(username);
        self
    }

    /// Attach a shutdown handle checked at every suspension point.
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Wrap the site in an [`Arc`] for sharing across requests.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// `family:code`, used in logs and cache descriptions.
    pub fn canonical_id(&self) -> String {
        format!("{}:{}", self.family.name(), self.code)
    }

    /// Site code within its family.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The family policy object.
    pub fn family(&self) -> &Family {
        &self.family
    }

    /// The engine configuration.
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// The per-site throttle.
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// The transport handle.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The shutdown handle, if attached.
    pub fn shutdown(&self) -> Option<&SharedShutdown> {
        self.shutdown.as_ref()
    }

    /// Full URL of the API script for this site.
    pub fn script_url(&self, secure: bool) -> ApiResult<String> {
        let host = self.family.hostname(&self.code)?;
        let scheme = if secure { "https" } else { "http" };
        Ok(format!(
            "{}://{}{}/api.php",
            scheme,
            host,
            self.family.script_path()
        ))
    }

    /// Whether this request should use secure transport: site policy
    /// plus action type (login may require SSL even when reads do not).
    pub fn use_secure(&self, action: &str) -> bool {
        if !self.family.ssl_available() {
            return false;
        }
        self.config.use_ssl_always || (action == "login" && self.config.use_ssl_on_login)
    }

    /// Current login status.
    pub async fn login_status(&self) -> LoginStatus {
        self.state.lock().await.login_status
    }

    /// Cached identity payload, if any.
    pub async fn user_info(&self) -> Option<Map<String, Value>> {
        self.state.lock().await.user_info.clone()
    }

    /// Expected username for a tier.
    pub async fn expected_username(&self, tier: LoginTier) -> Option<String> {
        self.state.lock().await.usernames[tier.index()].clone()
    }

    /// Login throttle deadline, if the server imposed one.
    pub async fn login_wait_until(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.login_wait_until
    }

    /// Record a server-imposed login throttle deadline.
    pub async fn set_login_wait_until(&self, until: DateTime<Utc>) {
        self.state.lock().await.login_wait_until = Some(until);
    }

    /// Run `f` with the state lock held. The engine's read-modify-write
    /// paths (session-loss detection, module-limit population) go through
    /// here so they are atomic with respect to other requests.
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut SiteState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    /// Cached module metadata, if already discovered.
    pub async fn module_info(&self, name: &str) -> Option<ModuleInfo> {
        self.state.lock().await.module_info.get(name).cloned()
    }

    /// Cache module metadata. First writer wins; concurrent cursors
    /// racing to populate the same module converge on one entry.
    pub async fn store_module_info(&self, name: &str, info: ModuleInfo) {
        let mut state = self.state.lock().await;
        state
            .module_info
            .entry(name.to_string())
            .or_insert(info);
    }

    /// Whether the cached identity matches the expected user at `tier`.
    pub async fn logged_in(&self, tier: LoginTier) -> bool {
        let state = self.state.lock().await;
        Self::logged_in_locked(&state, tier)
    }

    fn logged_in_locked(state: &SiteState, tier: LoginTier) -> bool {
        let Some(info) = &state.user_info else {
            return false;
        };
        let Some(name) = info.get("name").and_then(|v| v.as_str()) else {
            return false;
        };
        if name.is_empty() {
            return false;
        }
        if tier == LoginTier::Sysop {
            let in_sysop_group = info
                .get("groups")
                .and_then(|v| v.as_array())
                .map(|groups| groups.iter().any(|g| g.as_str() == Some("sysop")))
                .unwrap_or(false);
            if !in_sysop_group {
                return false;
            }
        }
        state.usernames[tier.index()].as_deref() == Some(name)
    }

    /// Whether the logged-in user holds a right (e.g. `apihighlimits`).
    pub async fn has_right(&self, right: &str) -> bool {
        let state = self.state.lock().await;
        state
            .user_info
            .as_ref()
            .and_then(|info| info.get("rights"))
            .and_then(|v| v.as_array())
            .map(|rights| rights.iter().any(|r| r.as_str() == Some(right)))
            .unwrap_or(false)
    }

    /// Identity marker for cache descriptions: the username when logged
    /// in, otherwise the anonymous status marker.
    pub async fn identity_marker(&self) -> String {
        let state = self.state.lock().await;
        if state.login_status.tier().is_some() {
            if let Some(name) = state
                .user_info
                .as_ref()
                .and_then(|info| info.get("name"))
                .and_then(|v| v.as_str())
            {
                return format!("User(User:{name})");
            }
        }
        state.login_status.cache_marker().to_string()
    }

    /// Fetch fresh identity information from the server.
    ///
    /// The submit loop caches the returned `userinfo` into site state as
    /// a side effect, so session tracking stays current.
    pub async fn fetch_user_info(self: &Arc<Self>) -> ApiResult<Map<String, Value>> {
        let mut params = ParamSet::new("query");
        params.set("meta", "userinfo")?;
        params.set("uiprop", "groups|rights")?;
        let mut request = Request::new(self.clone(), params).with_session_recovery(false);
        let result = request.submit().await?;
        result
            .get("query")
            .and_then(|q| q.get("userinfo"))
            .and_then(|u| u.as_object())
            .cloned()
            .ok_or_else(|| {
                ApiError::InvalidResponse("userinfo query returned no userinfo".to_string())
            })
    }

    /// Log in at the requested tier, if not already authenticated there.
    ///
    /// Probes existing session validity with a lightweight identity query
    /// before attempting the full credential exchange. Concurrent calls
    /// are serialized by the per-site login lock.
    pub async fn login(self: &Arc<Self>, tier: LoginTier) -> ApiResult<()> {
        let _guard = self.login_lock.lock().await;

        {
            let mut state = self.state.lock().await;
            if Self::logged_in_locked(&state, tier) {
                state.login_status = tier.status();
                return Ok(());
            }
            // A server-imposed throttle deadline refuses the whole attempt
            // up front, before the identity query goes out.
            if let Some(until) = state.login_wait_until {
                let now = Utc::now();
                if now < until {
                    let wait_seconds = (until - now).num_seconds().max(1);
                    warn!(
                        site = %self.canonical_id(),
                        wait_seconds,
                        "Login attempts throttled by server"
                    );
                    return Err(ApiError::LoginThrottled { wait_seconds });
                }
                state.login_wait_until = None;
            }
            state.login_status = LoginStatus::InProgress;
            state.user_info = None;
        }

        // An existing session cookie may still be valid; check before
        // spending a credential exchange.
        match self.fetch_user_info().await {
            Ok(info) => {
                let expected = self.expected_username(tier).await;
                let name = info.get("name").and_then(|v| v.as_str());
                if name.is_some() && name.map(|n| n.to_string()) == expected {
                    let mut state = self.state.lock().await;
                    if Self::logged_in_locked(&state, tier) {
                        state.login_status = tier.status();
                        info!(site = %self.canonical_id(), "Existing session still valid");
                        return Ok(());
                    }
                }
            }
            Err(ApiError::Api { code, .. }) => {
                // Typically no read permission while logged out; proceed
                // with the credential exchange.
                debug!(code = %code, "Identity probe rejected, attempting login");
            }
            Err(e) => {
                self.state.lock().await.login_status = LoginStatus::NotLoggedIn;
                return Err(e);
            }
        }

        let (username, password) = {
            let state = self.state.lock().await;
            let username = state.usernames[tier.index()].clone();
            let password = self.passwords[tier.index()].clone();
            match (username, password) {
                (Some(u), Some(p)) => (u, p),
                _ => {
                    drop(state);
                    self.state.lock().await.login_status = LoginStatus::NotLoggedIn;
                    return Err(ApiError::LoginFailed(format!(
                        "no credentials configured for {:?} on {}",
                        tier,
                        self.canonical_id()
                    )));
                }
            }
        };

        let manager = LoginManager::new(self.clone(), tier, username, password);
        match manager.login().await {
            Ok(canonical_name) => {
                {
                    let mut state = self.state.lock().await;
                    state.usernames[tier.index()] = Some(canonical_name);
                    state.user_info = None;
                }
                // Refresh identity so rights and groups are current.
                let refreshed = self.fetch_user_info().await;
                let mut state = self.state.lock().await;
                match refreshed {
                    Ok(_) => {
                        state.login_status = tier.status();
                        Ok(())
                    }
                    Err(e) => {
                        state.login_status = LoginStatus::NotLoggedIn;
                        Err(e)
                    }
                }
            }
            Err(e) => {
                warn!(site = %self.canonical_id(), error = %e, "Login failed");
                self.state.lock().await.login_status = LoginStatus::NotLoggedIn;
                Err(e)
            }
        }
    }

    /// Log out and reset session state.
    pub async fn logout(self: &Arc<Self>) -> ApiResult<()> {
        let params = ParamSet::new("logout");
        let mut request = Request::new(self.clone(), params).with_session_recovery(false);
        request.submit().await?;
        let mut state = self.state.lock().await;
        state.login_status = LoginStatus::NotLoggedIn;
        state.user_info = None;
        Ok(())
    }
}
