//! # MediaWiki API Client Engine
//!
//! An async client engine for the MediaWiki `api.php` protocol: parameter
//! normalization, retry with error classification, session management with
//! automatic re-login, continuation-based pagination, and a disk-backed
//! response cache.
//!
//! ## Features
//!
//! - **Retry & Backoff**: Exponential backoff with a bounded retry budget,
//!   distinguishing transient faults from fatal ones
//! - **Server Load Shedding**: `maxlag` responses feed the request throttle
//!   instead of consuming the retry budget
//! - **Session Recovery**: Expired logins are detected mid-request, the
//!   client re-authenticates and replays the request a bounded number of times
//! - **Lazy Pagination**: Continuation-linked query pages surface as an
//!   async stream of result items
//! - **Response Cache**: Idempotent reads persist to disk with atomic,
//!   lock-guarded writes safe to share across processes
//! - **Graceful Shutdown**: Every sleep and network call observes a
//!   cancellation signal
//!
//! ## Quick Start
//!
//! ```no_run
//! use mwapi_client::api::{ParamSet, QueryCursor, Request};
//! use mwapi_client::config::ApiConfig;
//! use mwapi_client::site::{Family, Site};
//! use mwapi_client::transport::HttpTransport;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let family = Family::new("wikipedia")
//!     .with_host("en", "en.wikipedia.org");
//! let config = ApiConfig::default();
//! let transport = Arc::new(HttpTransport::new("my-bot/1.0")?);
//! let site = Site::new(Arc::new(family), "en", Arc::new(config), transport).shared();
//!
//! let params = ParamSet::from_pairs([
//!     ("action", "query"),
//!     ("list", "backlinks"),
//!     ("bltitle", "Main Page"),
//! ])?;
//! let mut cursor = QueryCursor::new(Request::new(site, params))?;
//! cursor.set_maximum_items(100);
//! while let Some(item) = cursor.next_item().await? {
//!     println!("{item}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`api`] - Request execution, parameter sets, pagination, response cache
//! - [`site`] - Per-site session state, login orchestration, family registry
//! - [`login`] - Credential exchange with the token/throttle protocol
//! - [`throttle`] - Inter-request delay enforcement with lag feedback
//! - [`transport`] - HTTP POST transport with error classification
//! - [`config`] - Tunable knobs and protocol constants
//! - [`shutdown`] - Graceful shutdown coordination shared across modules

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Request execution engine
pub mod api;

/// Configuration and protocol constants
pub mod config;

/// Login credential exchange
pub mod login;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

/// Site session state and family resolution
pub mod site;

/// Inter-request throttling
pub mod throttle;

/// HTTP transport layer
pub mod transport;

// Re-export commonly used types
pub use api::{ApiError, ApiResult, CachedRequest, ParamSet, QueryCursor, Request};
pub use config::ApiConfig;
pub use login::{LoginStatus, LoginTier};
pub use site::{Family, FamilyRegistry, Site};
