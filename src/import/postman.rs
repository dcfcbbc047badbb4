use super::{split_query, Auth, Format, HttpRequest, ImportError, KeyValue, Session};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::BTreeMap;

lazy_static! {
    static ref VARIABLE: Regex = Regex::new(r"\{\{\s*([\w.\-]+)\s*\}\}").unwrap();
}

#[derive(Debug, Deserialize)]
struct Collection {
    info: Info,
    #[serde(default)]
    item: Vec<Item>,
    #[serde(default)]
    variable: Vec<Variable>,
    auth: Option<AuthBlock>,
}

#[derive(Debug, Deserialize)]
struct Info {
    #[serde(default)]
    name: String,
    schema: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Variable {
    key: String,
    #[serde(default)]
    value: serde_json::Value,
}

/// A request or a folder of items.
#[derive(Debug, Deserialize)]
struct Item {
    #[serde(default)]
    name: String,
    request: Option<Request>,
    #[serde(default)]
    item: Vec<Item>,
    auth: Option<AuthBlock>,
    #[serde(default)]
    response: Vec<Response>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Request {
    Url(String),
    Full(FullRequest),
}

#[derive(Debug, Deserialize)]
struct FullRequest {
    method: Option<String>,
    url: Option<Url>,
    #[serde(default)]
    header: Vec<Param>,
    body: Option<Body>,
    auth: Option<AuthBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Url {
    Raw(String),
    Parts {
        raw: Option<String>,
        protocol: Option<String>,
        #[serde(default)]
        host: Vec<String>,
        #[serde(default)]
        path: Vec<String>,
        #[serde(default)]
        query: Vec<Param>,
    },
}

#[derive(Debug, Deserialize)]
struct Param {
    key: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    disabled: bool,
}

impl Param {
    fn value(&self) -> String {
        json_text(&self.value)
    }
}

#[derive(Debug, Deserialize)]
struct Body {
    mode: Option<String>,
    raw: Option<String>,
    #[serde(default)]
    urlencoded: Vec<Param>,
}

#[derive(Debug, Deserialize)]
struct AuthBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    bearer: Vec<Param>,
    #[serde(default)]
    basic: Vec<Param>,
    #[serde(default)]
    apikey: Vec<Param>,
}

#[derive(Debug, Deserialize)]
struct Response {
    code: Option<u16>,
}

fn json_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolved auth, `None` inherits from the enclosing folder.
fn resolve_auth(block: Option<&AuthBlock>) -> Option<Option<Auth>> {
    let block = block?;
    let get = |params: &[Param], key: &str| {
        params
            .iter()
            .find(|p| p.key == key)
            .map(Param::value)
            .unwrap_or_default()
    };
    let auth = match block.kind.as_str() {
        "inherit" => return None,
        "bearer" => Some(Auth::Bearer {
            token: get(&block.bearer, "token"),
        }),
        "basic" => Some(Auth::Basic {
            username: get(&block.basic, "username"),
            password: get(&block.basic, "password"),
        }),
        "apikey" => {
            let key = get(&block.apikey, "key");
            Some(Auth::ApiKey {
                key: if key.is_empty() { "X-API-Key".into() } else { key },
                value: get(&block.apikey, "value"),
                in_query: get(&block.apikey, "in") == "query",
            })
        }
        other => {
            if other != "noauth" {
                log::debug!("postman: ignoring auth type '{}'", other);
            }
            None
        }
    };
    Some(auth)
}

struct Walker {
    vars: BTreeMap<String, String>,
    out: Vec<HttpRequest>,
}

impl Walker {
    fn subst(&self, s: &str) -> String {
        VARIABLE
            .replace_all(s, |c: &Captures| match self.vars.get(&c[1]) {
                Some(v) => v.clone(),
                None => c[0].to_string(),
            })
            .into_owned()
    }

    fn walk(&mut self, items: &[Item], prefix: &str, auth: &Option<Auth>) {
        for item in items {
            let name = if prefix.is_empty() {
                item.name.clone()
            } else {
                format!("{}/{}", prefix, item.name)
            };
            let auth = resolve_auth(item.auth.as_ref()).unwrap_or_else(|| auth.clone());
            if let Some(req) = item.request.as_ref() {
                let status = item.response.iter().find_map(|r| r.code);
                let r = self.request(name.clone(), req, &auth, status);
                self.out.push(r);
            }
            self.walk(&item.item, &name, &auth);
        }
    }

    fn request(
        &self,
        name: String,
        req: &Request,
        inherited: &Option<Auth>,
        expected_status: Option<u16>,
    ) -> HttpRequest {
        let full = match req {
            Request::Url(u) => {
                let (url, query) = split_query(&self.subst(u));
                let mut r = HttpRequest {
                    name,
                    method: "GET".into(),
                    url,
                    query,
                    expected_status,
                    ..HttpRequest::default()
                };
                if let Some(a) = inherited.clone() {
                    r.apply_auth(self.subst_auth(a));
                }
                return r;
            }
            Request::Full(f) => f,
        };

        let (url, query) = match full.url.as_ref() {
            None => (String::new(), Vec::new()),
            Some(Url::Raw(raw)) => split_query(&self.subst(raw)),
            Some(Url::Parts {
                raw,
                protocol,
                host,
                path,
                query,
            }) => {
                let raw = match raw {
                    Some(raw) => raw.clone(),
                    None => format!(
                        "{}://{}/{}",
                        protocol.as_deref().unwrap_or("http"),
                        host.join("."),
                        path.join("/")
                    ),
                };
                let (base, from_raw) = split_query(&self.subst(&raw));
                let query = if query.is_empty() {
                    from_raw
                } else {
                    query
                        .iter()
                        .filter(|p| !p.disabled)
                        .map(|p| KeyValue::new(self.subst(&p.key), self.subst(&p.value())))
                        .collect()
                };
                (base, query)
            }
        };

        let headers = full
            .header
            .iter()
            .filter(|h| !h.disabled)
            .map(|h| KeyValue::new(self.subst(&h.key), self.subst(&h.value())))
            .collect();
        let body = full.body.as_ref().and_then(|b| match b.mode.as_deref() {
            Some("urlencoded") => Some(
                b.urlencoded
                    .iter()
                    .filter(|p| !p.disabled)
                    .map(|p| format!("{}={}", self.subst(&p.key), self.subst(&p.value())))
                    .collect::<Vec<_>>()
                    .join("&"),
            ),
            _ => b.raw.as_ref().map(|raw| self.subst(raw)),
        });

        let mut r = HttpRequest {
            name,
            method: full
                .method
                .as_deref()
                .unwrap_or("GET")
                .to_ascii_uppercase(),
            url,
            headers,
            query,
            body,
            auth: None,
            expected_status,
        };
        let auth = resolve_auth(full.auth.as_ref()).unwrap_or_else(|| inherited.clone());
        if let Some(a) = auth {
            r.apply_auth(self.subst_auth(a));
        }
        r
    }

    fn subst_auth(&self, auth: Auth) -> Auth {
        match auth {
            Auth::Bearer { token } => Auth::Bearer {
                token: self.subst(&token),
            },
            Auth::Basic { username, password } => Auth::Basic {
                username: self.subst(&username),
                password: self.subst(&password),
            },
            Auth::ApiKey {
                key,
                value,
                in_query,
            } => Auth::ApiKey {
                key: self.subst(&key),
                value: self.subst(&value),
                in_query,
            },
        }
    }
}

pub(super) fn parse(doc: serde_json::Value) -> Result<Session, ImportError> {
    let c: Collection = serde_json::from_value(doc)?;
    if let Some(schema) = c.info.schema.as_deref() {
        if !schema.contains("v2.") {
            return Err(ImportError::UnsupportedVersion {
                format: Format::Postman,
                version: schema.to_string(),
            });
        }
    }
    let vars = c
        .variable
        .iter()
        .map(|v| (v.key.clone(), json_text(&v.value)))
        .collect::<BTreeMap<_, _>>();
    let mut w = Walker {
        vars,
        out: Vec::new(),
    };
    let root_auth = resolve_auth(c.auth.as_ref()).flatten();
    w.walk(&c.item, "", &root_auth);
    log::debug!("postman: imported {} requests from '{}'", w.out.len(), c.info.name);

    Ok(Session {
        name: c.info.name,
        format: Format::Postman,
        variables: w.vars,
        requests: w.out,
    })
}
