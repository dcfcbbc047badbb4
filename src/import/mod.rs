//! Import of recorded API traffic into the normalized request model used by
//! protocol aware mutation.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::Path};
use thiserror::Error;

/// HAR log parsing.
pub mod har;
/// Postman collection parsing.
pub mod postman;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unrecognized import format")]
    UnknownFormat,
    #[error("unsupported {format} version: {version}")]
    UnsupportedVersion { format: Format, version: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Postman,
    Har,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Postman => f.write_str("postman"),
            Format::Har => f.write_str("har"),
        }
    }
}

impl Format {
    /// Guesses the format from the top level shape of the document.
    pub fn detect(doc: &serde_json::Value) -> Option<Format> {
        let obj = doc.as_object()?;
        if obj.get("log").and_then(|l| l.get("entries")).is_some() {
            Some(Format::Har)
        } else if obj.contains_key("info") && obj.contains_key("item") {
            Some(Format::Postman)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub name: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Auth {
    Bearer { token: String },
    Basic { username: String, password: String },
    ApiKey { key: String, value: String, in_query: bool },
}

/// One normalized HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HttpRequest {
    pub name: String,
    pub method: String,
    /// Url without the query string.
    pub url: String,
    pub headers: Vec<KeyValue>,
    pub query: Vec<KeyValue>,
    pub body: Option<String>,
    pub auth: Option<Auth>,
    /// Status of the recorded response, if any.
    pub expected_status: Option<u16>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Applies auth that maps onto plain headers or params.
    /// Basic credentials stay structured on the request.
    pub(crate) fn apply_auth(&mut self, auth: Auth) {
        match &auth {
            Auth::Bearer { token } => self
                .headers
                .push(KeyValue::new("Authorization", format!("Bearer {}", token))),
            Auth::ApiKey {
                key,
                value,
                in_query: true,
            } => self.query.push(KeyValue::new(key.clone(), value.clone())),
            Auth::ApiKey { key, value, .. } => {
                self.headers.push(KeyValue::new(key.clone(), value.clone()))
            }
            Auth::Basic { .. } => {}
        }
        self.auth = Some(auth);
    }
}

/// Splits `url` at `?`, returning the base and the decoded-as-is query pairs.
pub(crate) fn split_query(url: &str) -> (String, Vec<KeyValue>) {
    match url.split_once('?') {
        Some((base, q)) => {
            let params = q
                .split('&')
                .filter(|p| !p.is_empty())
                .map(|p| match p.split_once('=') {
                    Some((k, v)) => KeyValue::new(k, v),
                    None => KeyValue::new(p, ""),
                })
                .collect();
            (base.to_string(), params)
        }
        None => (url.to_string(), Vec::new()),
    }
}

/// A group of requests imported from one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    pub format: Format,
    pub variables: BTreeMap<String, String>,
    pub requests: Vec<HttpRequest>,
}

/// Parses a Postman collection or a HAR log, detecting which one it is.
pub fn parse(text: &str) -> Result<Session, ImportError> {
    let doc: serde_json::Value = serde_json::from_str(text)?;
    match Format::detect(&doc).ok_or(ImportError::UnknownFormat)? {
        Format::Postman => postman::parse(doc),
        Format::Har => har::parse(doc),
    }
}

pub fn load(path: &Path) -> Result<Session, ImportError> {
    let text = std::fs::read_to_string(path).map_err(|e| ImportError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    parse(&text)
}
