//! Wire parameter normalization.
//!
//! A [`ParamSet`] is an ordered mapping from parameter name to an ordered
//! list of string values. Multi-value parameters travel pipe-joined on the
//! wire (`meta=userinfo|siteinfo`). The `action` parameter is fixed at
//! construction and immutable afterwards; a `write` flag is derived from
//! the fixed set of mutating actions.

use crate::config::WRITE_ACTIONS;
use std::fmt;
use std::path::Path;

/// Parameter construction and serialization errors.
#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    /// No `action` parameter was supplied.
    #[error("'action' specification missing from request parameters")]
    MissingAction,

    /// The `action` parameter cannot be changed after construction.
    #[error("'action' is immutable after construction")]
    ActionImmutable,

    /// Only the JSON wire format can be parsed.
    #[error("query format '{0}' cannot be parsed")]
    UnsupportedFormat(String),

    /// Reading an upload file failed.
    #[error("upload file error: {0}")]
    UploadFile(String),
}

/// Ordered multi-value request parameters with a fixed `action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSet {
    entries: Vec<(String, Vec<String>)>,
    write: bool,
}

impl ParamSet {
    /// Create a parameter set for the given action.
    ///
    /// `action=edit` automatically asserts a logged-in user so an expired
    /// session can never silently edit anonymously.
    pub fn new(action: &str) -> Self {
        let write = WRITE_ACTIONS.contains(&action);
        let mut set = Self {
            entries: vec![("action".to_string(), vec![action.to_string()])],
            write,
        };
        if action == "edit" {
            set.entries
                .push(("assert".to_string(), vec!["user".to_string()]));
        }
        set
    }

    /// Build a parameter set from key/value pairs.
    ///
    /// Fails before any network activity if `action` is absent. Values
    /// containing `|` are split into multi-value lists.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ParamError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let pairs: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
            .collect();
        let action = pairs
            .iter()
            .find(|(k, _)| k == "action")
            .map(|(_, v)| v.clone())
            .ok_or(ParamError::MissingAction)?;

        let mut set = Self::new(&action);
        for (key, value) in pairs {
            if key != "action" {
                set.insert(&key, &value);
            }
        }
        Ok(set)
    }

    /// The fixed action of this request.
    pub fn action(&self) -> &str {
        &self.entries[0].1[0]
    }

    /// Whether this action mutates wiki content.
    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Values for a parameter, if present.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Pipe-joined value for a parameter, if present.
    pub fn get_joined(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| v.join("|"))
    }

    /// Whether a parameter is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Set a parameter, splitting the value on `|`. Replaces any existing
    /// values and preserves the parameter's original position.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ParamError> {
        if key == "action" {
            return Err(ParamError::ActionImmutable);
        }
        self.insert(key, value);
        Ok(())
    }

    /// Set a parameter from an explicit value list.
    pub fn set_values(&mut self, key: &str, values: Vec<String>) -> Result<(), ParamError> {
        if key == "action" {
            return Err(ParamError::ActionImmutable);
        }
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = values,
            None => self.entries.push((key.to_string(), values)),
        }
        Ok(())
    }

    /// Remove a parameter, returning its values.
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        if key == "action" {
            return None;
        }
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Merge values into a parameter, deduplicating and sorting the result.
    pub fn merge_sorted(&mut self, key: &str, values: &[&str]) {
        let mut merged: Vec<String> = self
            .get(key)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        for value in values {
            if !merged.iter().any(|m| m == value) {
                merged.push(value.to_string());
            }
        }
        merged.sort();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = merged,
            None => self.entries.push((key.to_string(), merged)),
        }
    }

    /// Iterate parameters in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set holds only the action parameter.
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    fn insert(&mut self, key: &str, value: &str) {
        let values: Vec<String> = if value.is_empty() {
            vec![String::new()]
        } else {
            value.split('|').map(|s| s.to_string()).collect()
        };
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = values,
            None => self.entries.push((key.to_string(), values)),
        }
    }

    /// Normalize the set into its final wire form. Idempotent.
    ///
    /// - `format=json` is injected if absent; any other format is refused.
    /// - `maxlag` is injected when configured and not already set.
    /// - For `action=query`, `meta` gains `userinfo` and `uiprop` gains
    ///   `blockinfo` and `hasmsg` so session tracking stays current.
    pub fn normalize(&mut self, maxlag: Option<u32>) -> Result<(), ParamError> {
        if self.action() == "query" {
            let meta = self.get("meta").map(|v| v.to_vec()).unwrap_or_default();
            if !meta.iter().any(|m| m == "userinfo") {
                let mut meta = meta;
                meta.push("userinfo".to_string());
                // set_values never fails for non-action keys
                let _ = self.set_values("meta", meta);
            }
            self.merge_sorted("uiprop", &["blockinfo", "hasmsg"]);
        }
        if !self.contains("maxlag") {
            if let Some(lag) = maxlag {
                let _ = self.set("maxlag", &lag.to_string());
            }
        }
        if !self.contains("format") {
            let _ = self.set("format", "json");
        }
        let format = self.get_joined("format").unwrap_or_default();
        if format != "json" {
            return Err(ParamError::UnsupportedFormat(format));
        }
        Ok(())
    }

    /// Halve every parameter named with a `limit` suffix that carries an
    /// integer value. Mitigates oversized responses after a decode failure.
    /// Returns the names of the parameters changed.
    pub fn halve_limits(&mut self) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, values) in &mut self.entries {
            if !key.ends_with("limit") || values.len() != 1 {
                continue;
            }
            if let Ok(value) = values[0].parse::<u64>() {
                if value > 1 {
                    values[0] = (value / 2).to_string();
                    changed.push(key.clone());
                }
            }
        }
        changed
    }

    /// Pipe-joined pairs sorted by name, for cache descriptions.
    pub fn sorted_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.join("|")))
            .collect();
        pairs.sort();
        pairs
    }

    /// Encode as an `application/x-www-form-urlencoded` body.
    pub fn to_urlencoded(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.entries {
            serializer.append_pair(key, &values.join("|"));
        }
        serializer.finish()
    }

    /// Encode as a `multipart/form-data` body.
    ///
    /// The `file` parameter's value is treated as a local path whose
    /// contents become the file part. Returns the Content-Type header
    /// value (with boundary) and the body bytes.
    pub fn to_multipart(&self) -> Result<(String, Vec<u8>), ParamError> {
        let boundary = format!(
            "mwapi-{:x}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let mut body: Vec<u8> = Vec::new();
        for (key, values) in &self.entries {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            if key == "file" {
                let path = values.join("|");
                let filename = Path::new(&path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.clone());
                let content = std::fs::read(&path)
                    .map_err(|e| ParamError::UploadFile(format!("{path}: {e}")))?;
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(&content);
            } else {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{key}\"\r\n\r\n").as_bytes(),
                );
                body.extend_from_slice(values.join("|").as_bytes());
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        let content_type = format!("multipart/form-data; boundary={boundary}");
        Ok((content_type, body))
    }
}

impl fmt::Display for ParamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self
            .entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.join("|")))
            .collect();
        write!(f, "{}", joined.join("&"))
    }
}
