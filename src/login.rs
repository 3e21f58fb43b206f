//! Session authentication.
//!
//! [`LoginStatus`] tracks a site's authenticated-identity state;
//! [`LoginManager`] performs the credential exchange. Transitions:
//! `NotAttempted -> InProgress -> {AsUser, AsSysop}` on success,
//! `-> NotLoggedIn` on failure. A server-throttled login records a
//! wait-until timestamp and further attempts are refused until it
//! elapses. Concurrent logins on one site are serialized by the site's
//! login lock.

use crate::api::{ApiError, ApiResult, ParamSet, Request};
use crate::site::Site;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Privilege tier requested for a login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginTier {
    /// Ordinary user account.
    User,
    /// Sysop account.
    Sysop,
}

impl LoginTier {
    /// Index into the site's per-tier username/password tables.
    pub fn index(self) -> usize {
        match self {
            LoginTier::User => 0,
            LoginTier::Sysop => 1,
        }
    }

    /// The login status reached on success at this tier.
    pub fn status(self) -> LoginStatus {
        match self {
            LoginTier::User => LoginStatus::AsUser,
            LoginTier::Sysop => LoginStatus::AsSysop,
        }
    }
}

/// Authenticated-identity state for one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginStatus {
    /// No login has been attempted yet.
    #[default]
    NotAttempted,
    /// A login attempt is in flight.
    InProgress,
    /// The last attempt failed or the session was lost.
    NotLoggedIn,
    /// Authenticated as an ordinary user.
    AsUser,
    /// Authenticated as a sysop.
    AsSysop,
}

impl LoginStatus {
    /// The privilege tier of this status, if authenticated.
    pub fn tier(self) -> Option<LoginTier> {
        match self {
            LoginStatus::AsUser => Some(LoginTier::User),
            LoginStatus::AsSysop => Some(LoginTier::Sysop),
            _ => None,
        }
    }

    /// Stable marker used in cache descriptions for anonymous requests.
    pub fn cache_marker(self) -> &'static str {
        match self {
            LoginStatus::AsSysop => "AsSysop",
            LoginStatus::AsUser => "AsUser",
            // anything below logged-in collapses to the anonymous marker
            _ => "NotLoggedIn",
        }
    }
}

/// Performs the `action=login` credential exchange for one tier.
pub struct LoginManager {
    site: Arc<Site>,
    tier: LoginTier,
    username: String,
    password: String,
}

impl LoginManager {
    /// Create a manager for the given credentials.
    pub fn new(
        site: Arc<Site>,
        tier: LoginTier,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            site,
            tier,
            username: username.into(),
            password: password.into(),
        }
    }

    /// Run the credential exchange.
    ///
    /// If the server requests a token, the exchange is retried exactly
    /// once including that token. A `Throttled` result records the
    /// wait-until timestamp on the site and surfaces
    /// [`ApiError::LoginThrottled`]; attempts before the timestamp
    /// elapses are refused without any network call.
    ///
    /// Returns the canonical username reported by the server.
    pub async fn login(&self) -> ApiResult<String> {
        if let Some(until) = self.site.login_wait_until().await {
            let now = Utc::now();
            if now < until {
                let wait_seconds = (until - now).num_seconds().max(1);
                warn!(
                    site = %self.site.canonical_id(),
                    wait_seconds,
                    "Login attempts throttled by server"
                );
                return Err(ApiError::LoginThrottled { wait_seconds });
            }
        }

        let mut params = ParamSet::new("login");
        params.set("lgname", &self.username)?;
        params.set("lgpassword", &self.password)?;
        let mut request =
            Request::new(self.site.clone(), params).with_session_recovery(false);

        let mut token_sent = false;
        loop {
            let result = request.submit().await?;
            let login = result.get("login").ok_or_else(|| {
                ApiError::InvalidResponse("login response has no 'login' key".to_string())
            })?;
            let outcome = login
                .get("result")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown");

            match outcome {
                "Success" => {
                    let name = login
                        .get("lgusername")
                        .and_then(|v| v.as_str())
                        .unwrap_or(&self.username)
                        .to_string();
                    info!(
                        site = %self.site.canonical_id(),
                        user = %name,
                        tier = ?self.tier,
                        "Login succeeded"
                    );
                    return Ok(name);
                }
                "NeedToken" if !token_sent => {
                    let token = login
                        .get("token")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            ApiError::InvalidResponse(
                                "NeedToken response carries no token".to_string(),
                            )
                        })?
                        .to_string();
                    debug!("Retrying login with server-issued token");
                    request.params_mut().set("lgtoken", &token)?;
                    token_sent = true;
                }
                "Throttled" => {
                    let wait_seconds = login
                        .get("wait")
                        .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()))
                        .unwrap_or(60);
                    let until = Utc::now() + chrono::Duration::seconds(wait_seconds);
                    self.site.set_login_wait_until(until).await;
                    warn!(
                        site = %self.site.canonical_id(),
                        wait_seconds,
                        "Server throttled the login"
                    );
                    return Err(ApiError::LoginThrottled { wait_seconds });
                }
                other => {
                    return Err(ApiError::LoginFailed(other.to_string()));
                }
            }
        }
    }

    /// The tier this manager authenticates at.
    pub fn tier(&self) -> LoginTier {
        self.tier
    }
}
