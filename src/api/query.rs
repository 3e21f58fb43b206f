//! Lazy pagination over `action=query` responses.
//!
//! A [`QueryCursor`] wraps a [`Request`] and walks continuation-linked
//! pages, yielding one result item at a time. Module metadata (page-size
//! limit and parameter prefix) is discovered once per module through the
//! long-expiry response cache and shared across cursors via the site
//! state. Pages are fetched strictly in order; the continuation token for
//! page N+1 is only known after page N arrives.

use crate::api::{ApiError, ApiResult, CachedRequest, ParamSet, Request};
use crate::login::LoginTier;
use crate::site::ModuleInfo;
use futures_util::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Content queries get oversized responses; cap their page size.
const CONTENT_PAGE_LIMIT: u64 = 250;

/// String form of a continuation token. The server sometimes sends
/// integers where the next request needs a string.
fn continuation_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Normalize a result container into an ordered item list.
///
/// A `results` sub-key wins; otherwise a map is ordered by the
/// server-provided `pageids` list when present, else by sorted key.
/// Lists pass through unchanged.
fn container_items(query: &Map<String, Value>, result_key: &str) -> Option<Vec<Value>> {
    let container = query.get(result_key)?;
    let items = match container {
        Value::Array(list) => list.clone(),
        Value::Object(map) => {
            if let Some(results) = map.get("results") {
                match results {
                    Value::Array(list) => list.clone(),
                    other => vec![other.clone()],
                }
            } else if let Some(pageids) = query.get("pageids").and_then(|v| v.as_array()) {
                pageids
                    .iter()
                    .filter_map(|id| {
                        let key = match id {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        map.get(&key).cloned()
                    })
                    .collect()
            } else {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                keys.into_iter().filter_map(|k| map.get(k).cloned()).collect()
            }
        }
        other => vec![other.clone()],
    };
    Some(items)
}

/// Forward-only iterator over the items of a paginated query.
pub struct QueryCursor {
    request: Request,
    module: String,
    generator: bool,
    continue_keys: Vec<String>,
    result_key: String,
    prefix: Option<String>,
    api_limit: Option<u64>,
    query_limit: Option<u64>,
    increment_override: bool,
    limit: Option<i64>,
    count: u64,
    buffer: VecDeque<Value>,
    pages_exhausted: bool,
    cap_reached: bool,
    initialized: bool,
}

impl QueryCursor {
    /// Wrap a query request. The parameters must carry `action=query`
    /// and exactly one of `generator`, `list`, `prop`, or `meta`; the
    /// first of those present names the module.
    pub fn new(mut request: Request) -> ApiResult<Self> {
        if request.params().action() != "query" {
            return Err(ApiError::InvalidModule(format!(
                "cursor requires action=query, not '{}'",
                request.params().action()
            )));
        }
        let mut module = None;
        let mut generator = false;
        for modtype in ["generator", "list", "prop", "meta"] {
            if let Some(value) = request.params().get_joined(modtype) {
                module = Some(value);
                generator = modtype == "generator";
                break;
            }
        }
        let module = module.ok_or_else(|| {
            ApiError::InvalidModule("no query module name found in parameters".to_string())
        })?;

        // always ask for the pageids list so map containers keep the
        // server's ordering
        request.params_mut().set("indexpageids", "")?;

        let continue_keys = module.split('|').map(str::to_string).collect();
        let result_key = if generator {
            "pages".to_string()
        } else {
            module.clone()
        };
        Ok(Self {
            request,
            module,
            generator,
            continue_keys,
            result_key,
            prefix: None,
            api_limit: None,
            query_limit: None,
            increment_override: false,
            limit: None,
            count: 0,
            buffer: VecDeque::new(),
            pages_exhausted: false,
            cap_reached: false,
            initialized: false,
        })
    }

    /// The query module this cursor iterates.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Cap the total number of items yielded. A negative value omits
    /// the limit parameter from requests entirely (some property
    /// queries require this to mean "current item only").
    pub fn set_maximum_items(&mut self, value: i64) {
        self.limit = Some(value);
    }

    /// Ask for at most `value` items per page instead of the module
    /// maximum. Clamped to the discovered module limit.
    pub fn set_query_increment(&mut self, value: u64) {
        let clamped = match self.api_limit {
            Some(api_limit) if self.initialized => value.min(api_limit),
            _ => value,
        };
        self.query_limit = Some(clamped);
        self.increment_override = true;
        debug!(module = %self.module, query_limit = clamped, "Set query increment");
    }

    /// Restrict the query to the given namespaces via the module's
    /// prefixed namespace parameter.
    pub async fn set_namespace(&mut self, namespaces: &[i64]) -> ApiResult<()> {
        self.ensure_module_info().await?;
        let joined = namespaces
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join("|");
        if let Some(prefix) = &self.prefix {
            self.request
                .params_mut()
                .set(&format!("{prefix}namespace"), &joined)?;
        }
        Ok(())
    }

    /// Discover the module's page-size limit and parameter prefix,
    /// through the long-expiry cache, storing the metadata in the site
    /// state so later cursors skip the network round trip.
    async fn ensure_module_info(&mut self) -> ApiResult<()> {
        if self.initialized {
            return Ok(());
        }
        let site = self.request.site().clone();
        let names: Vec<String> = self.module.split('|').map(str::to_string).collect();

        let mut missing = false;
        for name in &names {
            if site.module_info(name).await.is_none() {
                missing = true;
                break;
            }
        }
        if missing {
            let mut params = ParamSet::new("paraminfo");
            params.set("querymodules", &self.module)?;
            let request = Request::new(site.clone(), params);
            let mut cached = CachedRequest::new(request, site.config().module_info_expiry);
            let data = cached.submit().await?;
            let modules = data
                .get("paraminfo")
                .and_then(|p| p.get("querymodules"))
                .and_then(|v| v.as_array())
                .ok_or_else(|| {
                    ApiError::InvalidResponse(
                        "paraminfo response missing querymodules".to_string(),
                    )
                })?;
            for entry in modules {
                let name = entry.get("name").and_then(|v| v.as_str()).ok_or_else(|| {
                    ApiError::InvalidResponse("paraminfo entry missing name".to_string())
                })?;
                if entry.get("missing").is_some() {
                    return Err(ApiError::InvalidModule(self.module.clone()));
                }
                let prefix = entry
                    .get("prefix")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let mut limit_max = None;
                let mut limit_highmax = None;
                if let Some(parameters) = entry.get("parameters").and_then(|v| v.as_array()) {
                    for param in parameters {
                        if param.get("name").and_then(|v| v.as_str()) == Some("limit") {
                            limit_max = param.get("max").and_then(|v| v.as_u64());
                            limit_highmax = param.get("highmax").and_then(|v| v.as_u64());
                            break;
                        }
                    }
                }
                site.store_module_info(
                    name,
                    ModuleInfo {
                        prefix,
                        limit_max,
                        limit_highmax,
                    },
                )
                .await;
            }
        }

        let status = site.login_status().await;
        let high_limits = match status.tier() {
            Some(LoginTier::User) | Some(LoginTier::Sysop) => {
                site.has_right("apihighlimits").await
            }
            None => false,
        };
        for name in &names {
            let info = site
                .module_info(name)
                .await
                .ok_or_else(|| ApiError::InvalidModule(self.module.clone()))?;
            if let Some(max) = info.limit_max {
                self.api_limit = Some(if high_limits {
                    info.limit_highmax.unwrap_or(max)
                } else {
                    max
                });
                if self.prefix.is_none() {
                    self.prefix = Some(if self.generator {
                        format!("g{}", info.prefix)
                    } else {
                        info.prefix.clone()
                    });
                }
                break;
            }
        }
        match self.query_limit {
            Some(requested) if self.increment_override => {
                if let Some(api_limit) = self.api_limit {
                    self.query_limit = Some(requested.min(api_limit));
                }
            }
            _ => self.query_limit = self.api_limit,
        }
        debug!(
            module = %self.module,
            api_limit = ?self.api_limit,
            prefix = ?self.prefix,
            "Query module metadata ready"
        );
        self.initialized = true;
        Ok(())
    }

    /// Fetch one page into the buffer and merge its continuation tokens
    /// into the next request.
    async fn fetch_page(&mut self) -> ApiResult<()> {
        self.ensure_module_info().await?;

        if let Some(query_limit) = self.query_limit {
            let new_limit = match self.limit {
                None => Some(query_limit),
                Some(cap) if cap > 0 => {
                    Some(query_limit.min((cap as u64).saturating_sub(self.count)))
                }
                Some(_) => None,
            };
            if let Some(mut new_limit) = new_limit {
                let content_query = self
                    .request
                    .params()
                    .get("rvprop")
                    .map(|values| values.iter().any(|v| v == "content"))
                    .unwrap_or(false);
                if content_query {
                    if let Some(api_limit) = self.api_limit {
                        new_limit = new_limit.min((api_limit / 10).max(1));
                    }
                    new_limit = new_limit.min(CONTENT_PAGE_LIMIT);
                }
                if let Some(prefix) = &self.prefix {
                    self.request
                        .params_mut()
                        .set(&format!("{prefix}limit"), &new_limit.to_string())?;
                }
            }
        }

        let data = self.request.submit().await?;
        let Some(query) = data.get("query").and_then(|v| v.as_object()) else {
            debug!(module = %self.module, "Stopping iteration: no 'query' element in response");
            self.pages_exhausted = true;
            return Ok(());
        };
        let Some(items) = container_items(query, &self.result_key) else {
            debug!(
                module = %self.module,
                result_key = %self.result_key,
                "Stopping iteration: result container missing"
            );
            self.pages_exhausted = true;
            return Ok(());
        };
        self.buffer.extend(items);

        // the random module never continues; keep issuing fresh queries
        // while a cap bounds the loop
        if self.module == "random" && self.limit.map_or(false, |cap| cap != 0) {
            return Ok(());
        }

        if let Some(groups) = data.get("query-continue").and_then(|v| v.as_object()) {
            if !self.continue_keys.iter().any(|k| groups.contains_key(k)) {
                warn!(
                    keys = ?self.continue_keys,
                    "Missing continue keys in 'query-continue' element"
                );
                self.pages_exhausted = true;
                return Ok(());
            }
            let mut tokens: Vec<(String, String)> = Vec::new();
            for group in groups.values() {
                if let Some(map) = group.as_object() {
                    for (key, value) in map {
                        tokens.push((key.clone(), continuation_value(value)));
                    }
                }
            }
            for (key, value) in tokens {
                self.request.params_mut().set(&key, &value)?;
            }
        } else if let Some(cont) = data.get("continue").and_then(|v| v.as_object()) {
            for (key, value) in cont {
                let value = continuation_value(value);
                self.request.params_mut().set(key, &value)?;
            }
        } else {
            self.pages_exhausted = true;
        }
        Ok(())
    }

    /// Yield the next result item, fetching further pages as needed.
    /// Returns `Ok(None)` once the sequence is complete.
    pub async fn next_item(&mut self) -> ApiResult<Option<Value>> {
        loop {
            if self.cap_reached {
                return Ok(None);
            }
            if let Some(item) = self.buffer.pop_front() {
                // when the continuation key lives at a nested level
                // (revisions within pages), count those sub-items
                let nested: u64 = self
                    .continue_keys
                    .iter()
                    .filter_map(|key| item.get(key))
                    .map(|v| v.as_array().map(|a| a.len() as u64).unwrap_or(1))
                    .sum();
                self.count += if nested > 0 { nested } else { 1 };
                if let Some(cap) = self.limit {
                    if cap > 0 && self.count >= cap as u64 {
                        self.cap_reached = true;
                    }
                }
                return Ok(Some(item));
            }
            if self.pages_exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    /// Consume the cursor as an async stream of raw items. The stream
    /// ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = ApiResult<Value>> {
        stream::unfold(self, |mut cursor| async move {
            match cursor.next_item().await {
                Ok(Some(item)) => Some((Ok(item), cursor)),
                Ok(None) => None,
                Err(e) => {
                    cursor.cap_reached = true;
                    Some((Err(e), cursor))
                }
            }
        })
    }

    /// Consume the cursor as a stream of deserialized records.
    pub fn into_typed_stream<T>(self) -> impl Stream<Item = ApiResult<T>>
    where
        T: DeserializeOwned,
    {
        self.into_stream().map(|item| {
            item.and_then(|value| {
                serde_json::from_value(value)
                    .map_err(|e| ApiError::InvalidResponse(format!("item decode failed: {e}")))
            })
        })
    }
}
