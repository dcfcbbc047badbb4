//! Structure aware mutation of HTTP requests.
//!
//! Every mutable field of the chosen kind is paired with every probe of the
//! catalogue, so a pass yields `|fields| * |catalogue|` requests.

use crate::import::{HttpRequest, KeyValue};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMutationKind {
    Headers,
    Body,
    Params,
    Method,
}

impl HttpMutationKind {
    pub const ALL: [HttpMutationKind; 4] = [
        HttpMutationKind::Headers,
        HttpMutationKind::Body,
        HttpMutationKind::Params,
        HttpMutationKind::Method,
    ];
}

/// Injection and structure probes.
pub const ATTACK_PAYLOADS: [&str; 16] = [
    "<script>alert(1)</script>",
    "\"><img src=x onerror=alert(1)>",
    "../../../../etc/passwd",
    "..%2f..%2f..%2fetc%2fpasswd",
    "{{7*7}}",
    "${7*7}",
    "' OR '1'='1",
    "1; DROP TABLE users--",
    "-1",
    "0",
    "2147483648",
    "1e308",
    "null",
    "true",
    "[]",
    "{}",
];

pub const ALT_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "TRACE"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutatedRequest {
    pub request: HttpRequest,
    pub kind: HttpMutationKind,
    pub field: String,
    pub payload: String,
}

/// All mutations of `kind` for `req`.
pub fn mutate_request(req: &HttpRequest, kind: HttpMutationKind) -> Vec<MutatedRequest> {
    match kind {
        HttpMutationKind::Headers => {
            per_field(req, kind, field_names(&req.headers), |r, field, p| {
                set_value(&mut r.headers, field, p)
            })
        }
        HttpMutationKind::Params => per_field(req, kind, field_names(&req.query), |r, field, p| {
            set_value(&mut r.query, field, p)
        }),
        HttpMutationKind::Body => mutate_body(req),
        HttpMutationKind::Method => ALT_METHODS
            .iter()
            .map(|m| {
                let mut r = req.clone();
                r.method = m.to_string();
                MutatedRequest {
                    request: r,
                    kind,
                    field: "method".into(),
                    payload: m.to_string(),
                }
            })
            .collect(),
    }
}

/// Mutations of every kind, in [`HttpMutationKind::ALL`] order.
pub fn mutate_all(req: &HttpRequest) -> Vec<MutatedRequest> {
    HttpMutationKind::ALL
        .iter()
        .flat_map(|k| mutate_request(req, *k))
        .collect()
}

fn field_names(kvs: &[KeyValue]) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(kvs.len());
    for kv in kvs {
        if !names.iter().any(|n| n.eq_ignore_ascii_case(&kv.name)) {
            names.push(kv.name.clone());
        }
    }
    names
}

fn set_value(kvs: &mut [KeyValue], field: &str, payload: &str) {
    for kv in kvs.iter_mut().filter(|kv| kv.name.eq_ignore_ascii_case(field)) {
        kv.value = payload.to_string();
    }
}

fn per_field<F>(
    req: &HttpRequest,
    kind: HttpMutationKind,
    fields: Vec<String>,
    mut apply: F,
) -> Vec<MutatedRequest>
where
    F: FnMut(&mut HttpRequest, &str, &str),
{
    let mut out = Vec::with_capacity(fields.len() * ATTACK_PAYLOADS.len());
    for field in fields {
        for payload in ATTACK_PAYLOADS.iter() {
            let mut r = req.clone();
            apply(&mut r, &field, payload);
            out.push(MutatedRequest {
                request: r,
                kind,
                field: field.clone(),
                payload: payload.to_string(),
            });
        }
    }
    out
}

/// JSON object bodies are mutated per top level key, anything else as a whole.
fn mutate_body(req: &HttpRequest) -> Vec<MutatedRequest> {
    let kind = HttpMutationKind::Body;
    let object = req
        .body
        .as_deref()
        .and_then(|b| serde_json::from_str::<serde_json::Value>(b).ok())
        .and_then(|v| match v {
            serde_json::Value::Object(m) if !m.is_empty() => Some(m),
            _ => None,
        });

    match object {
        Some(map) => {
            let fields = map.keys().cloned().collect();
            per_field(req, kind, fields, |r, field, p| {
                let mut m = map.clone();
                // Probes that are valid JSON keep their type, e.g. `null` or `[]`.
                let v = serde_json::from_str(p)
                    .unwrap_or_else(|_| serde_json::Value::String(p.to_string()));
                m.insert(field.to_string(), v);
                r.body = Some(serde_json::Value::Object(m).to_string());
            })
        }
        None => per_field(req, kind, vec!["body".to_string()], |r, _, p| {
            r.body = Some(p.to_string())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> HttpRequest {
        HttpRequest {
            name: "create".into(),
            method: "POST".into(),
            url: "http://localhost/items".into(),
            headers: vec![
                KeyValue::new("Content-Type", "application/json"),
                KeyValue::new("X-Trace", "1"),
            ],
            query: vec![KeyValue::new("page", "1")],
            body: Some(r#"{"name":"a","count":1,"tags":[]}"#.into()),
            ..HttpRequest::default()
        }
    }

    #[test]
    fn cardinality() {
        let r = request();
        let n = ATTACK_PAYLOADS.len();
        assert_eq!(mutate_request(&r, HttpMutationKind::Headers).len(), 2 * n);
        assert_eq!(mutate_request(&r, HttpMutationKind::Params).len(), n);
        assert_eq!(mutate_request(&r, HttpMutationKind::Body).len(), 3 * n);
        assert_eq!(
            mutate_request(&r, HttpMutationKind::Method).len(),
            ALT_METHODS.len()
        );
        assert_eq!(mutate_all(&r).len(), 6 * n + ALT_METHODS.len());
    }

    #[test]
    fn every_field_gets_every_probe() {
        let r = request();
        let muts = mutate_request(&r, HttpMutationKind::Headers);
        for field in ["Content-Type", "X-Trace"] {
            for p in ATTACK_PAYLOADS.iter() {
                assert!(muts.iter().any(|m| m.field == field
                    && m.payload == *p
                    && m.request.header(field) == Some(*p)));
            }
        }
    }

    #[test]
    fn json_body_keeps_probe_types() {
        let r = request();
        let muts = mutate_request(&r, HttpMutationKind::Body);
        let m = muts
            .iter()
            .find(|m| m.field == "count" && m.payload == "null")
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(m.request.body.as_deref().unwrap()).unwrap();
        assert!(v["count"].is_null());
        assert_eq!(v["name"], "a");

        let m = muts
            .iter()
            .find(|m| m.field == "name" && m.payload.starts_with("<script>"))
            .unwrap();
        assert!(m.request.body.as_deref().unwrap().contains("<script>"));
    }

    #[test]
    fn raw_body_and_no_fields() {
        let mut r = request();
        r.body = None;
        r.headers.clear();
        r.query.clear();
        assert!(mutate_request(&r, HttpMutationKind::Headers).is_empty());
        assert!(mutate_request(&r, HttpMutationKind::Params).is_empty());
        let body = mutate_request(&r, HttpMutationKind::Body);
        assert_eq!(body.len(), ATTACK_PAYLOADS.len());
        assert_eq!(body[2].request.body.as_deref(), Some(ATTACK_PAYLOADS[2]));
    }
}
