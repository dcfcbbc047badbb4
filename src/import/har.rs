use super::{split_query, Format, HttpRequest, ImportError, KeyValue, Session};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct Har {
    log: Log,
}

#[derive(Debug, Deserialize)]
struct Log {
    #[serde(default)]
    version: String,
    creator: Option<Creator>,
    #[serde(default)]
    entries: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Creator {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Entry {
    request: Request,
    response: Option<Response>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Request {
    method: String,
    url: String,
    #[serde(default)]
    headers: Vec<NameValue>,
    #[serde(default)]
    query_string: Vec<NameValue>,
    post_data: Option<PostData>,
}

#[derive(Debug, Deserialize)]
struct NameValue {
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostData {
    #[serde(default)]
    mime_type: String,
    text: Option<String>,
    #[serde(default)]
    params: Vec<NameValue>,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    status: i64,
}

const SUPPORTED_VERSIONS: [&str; 3] = ["", "1.1", "1.2"];

pub(super) fn parse(doc: serde_json::Value) -> Result<Session, ImportError> {
    let har: Har = serde_json::from_value(doc)?;
    if !SUPPORTED_VERSIONS.contains(&har.log.version.as_str()) {
        return Err(ImportError::UnsupportedVersion {
            format: Format::Har,
            version: har.log.version,
        });
    }

    let mut requests = Vec::with_capacity(har.log.entries.len());
    for (i, entry) in har.log.entries.into_iter().enumerate() {
        let req = entry.request;
        let (url, from_url) = split_query(&req.url);
        let query = if req.query_string.is_empty() {
            from_url
        } else {
            req.query_string
                .into_iter()
                .map(|q| KeyValue::new(q.name, q.value))
                .collect()
        };
        // HTTP/2 pseudo headers are not replayable.
        let headers = req
            .headers
            .into_iter()
            .filter(|h| !h.name.starts_with(':'))
            .map(|h| KeyValue::new(h.name, h.value))
            .collect::<Vec<_>>();
        let body = req.post_data.and_then(|p| match p.text {
            Some(t) => Some(t),
            None if !p.params.is_empty() => Some(
                p.params
                    .iter()
                    .map(|kv| format!("{}={}", kv.name, kv.value))
                    .collect::<Vec<_>>()
                    .join("&"),
            ),
            None => {
                log::debug!("har: entry {} has empty {} body", i, p.mime_type);
                None
            }
        });
        let expected_status = entry
            .response
            .map(|r| r.status)
            .filter(|s| (100..=599).contains(s))
            .map(|s| s as u16);

        requests.push(HttpRequest {
            name: format!("{} {}", req.method, url),
            method: req.method.to_ascii_uppercase(),
            url,
            headers,
            query,
            body,
            auth: None,
            expected_status,
        });
    }

    Ok(Session {
        name: har
            .log
            .creator
            .map(|c| c.name)
            .unwrap_or_else(|| "har".to_string()),
        format: Format::Har,
        variables: BTreeMap::new(),
        requests,
    })
}
