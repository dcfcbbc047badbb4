//! Live monitoring channel.
//!
//! Sessions (one per fuzz job) publish metrics and discrete events. Connected
//! clients subscribe to sessions by id; metrics of sessions with at least one
//! subscriber are pushed on every [`Monitor::tick`], crash and coverage events
//! are pushed at once.
//!
//! With a [`JobControl`] attached, clients can also submit fuzz jobs, cancel
//! them and query their status. A job's id doubles as its session id.

use crate::{
    fuzz::FuzzJob,
    queue::{Job, JobQueue, QueueError},
};
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    sync::{Arc, Mutex},
    time::Instant,
};
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};

/// Line delimited json transport.
pub mod server;

pub use server::MonitorServer;

/// Messages buffered per client, a client further behind is disconnected.
pub const CLIENT_BACKLOG: usize = 256;

/// Job operations reachable from monitor clients.
pub trait JobControl: Send + Sync {
    fn submit(&self, job: FuzzJob) -> Result<String, QueueError>;
    fn cancel(&self, id: &str) -> Result<bool, QueueError>;
    fn job(&self, id: &str) -> Option<Job>;
}

impl JobControl for JobQueue {
    fn submit(&self, job: FuzzJob) -> Result<String, QueueError> {
        JobQueue::submit(self, job)
    }

    fn cancel(&self, id: &str) -> Result<bool, QueueError> {
        self.cancel_job(id)
    }

    fn job(&self, id: &str) -> Option<Job> {
        self.get_job(id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub exec_per_sec: f64,
    pub coverage: u64,
    pub crashes: u64,
    pub corpus_size: u64,
    pub active_workers: u64,
    pub uptime_secs: u64,
    pub memory_usage: u64,
}

/// Partial metrics update, unset fields keep their value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsUpdate {
    pub exec_per_sec: Option<f64>,
    pub coverage: Option<u64>,
    pub crashes: Option<u64>,
    pub corpus_size: Option<u64>,
    pub active_workers: Option<u64>,
    pub memory_usage: Option<u64>,
}

impl SessionMetrics {
    fn apply(&mut self, u: &MetricsUpdate) {
        if let Some(v) = u.exec_per_sec {
            self.exec_per_sec = v;
        }
        if let Some(v) = u.coverage {
            self.coverage = v;
        }
        if let Some(v) = u.crashes {
            self.crashes = v;
        }
        if let Some(v) = u.corpus_size {
            self.corpus_size = v;
        }
        if let Some(v) = u.active_workers {
            self.active_workers = v;
        }
        if let Some(v) = u.memory_usage {
            self.memory_usage = v;
        }
    }
}

/// Requests sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Unsubscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Ping {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
    },
    Submit {
        job: FuzzJob,
    },
    Cancel {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    Status {
        #[serde(rename = "jobId")]
        job_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Metrics,
    Event,
    Crash,
    CoverageIncrease,
    Pong,
    /// Answer to submit, cancel and status.
    Job,
    Error,
}

/// Messages pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub session_id: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ServerMessage {
    pub fn new(kind: MessageKind, session_id: Option<&str>, data: serde_json::Value) -> Self {
        Self {
            kind,
            session_id: session_id.map(str::to_string),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Self::new(MessageKind::Error, None, json!({ "message": message.to_string() }))
    }
}

fn job_summary(job: &Job) -> serde_json::Value {
    json!({
        "jobId": job.id,
        "kind": job.payload.kind(),
        "status": job.status,
        "attempts": job.attempts,
        "error": job.error,
        "result": job.result,
    })
}

struct Session {
    metrics: SessionMetrics,
    started: Instant,
}

struct Client {
    tx: Sender<ServerMessage>,
    sessions: FxHashSet<String>,
}

#[derive(Default)]
struct State {
    sessions: FxHashMap<String, Session>,
    clients: FxHashMap<u64, Client>,
    next_client: u64,
}

impl State {
    fn session(&mut self, id: &str) -> &mut Session {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| Session {
                metrics: SessionMetrics::default(),
                started: Instant::now(),
            })
    }

    fn snapshot(&self, id: &str) -> Option<SessionMetrics> {
        self.sessions.get(id).map(|s| {
            let mut m = s.metrics.clone();
            m.uptime_secs = s.started.elapsed().as_secs();
            m
        })
    }

    /// Sends to subscribers of `session`, dropping clients that went away or
    /// fell [`CLIENT_BACKLOG`] messages behind.
    fn publish(&mut self, session: &str, msg: &ServerMessage) -> usize {
        let mut sent = 0;
        self.clients.retain(|id, c| {
            if !c.sessions.contains(session) {
                return true;
            }
            let ok = offer(*id, &c.tx, msg.clone());
            sent += ok as usize;
            ok
        });
        sent
    }

    fn reply(&mut self, client: u64, msg: ServerMessage) {
        let ok = match self.clients.get(&client) {
            Some(c) => offer(client, &c.tx, msg),
            None => return,
        };
        if !ok {
            self.clients.remove(&client);
        }
    }
}

fn offer(client: u64, tx: &Sender<ServerMessage>, msg: ServerMessage) -> bool {
    match tx.try_send(msg) {
        Ok(()) => true,
        Err(e) => {
            if matches!(e, TrySendError::Full(_)) {
                log::warn!("monitor: client {} too slow, disconnected", client);
            }
            false
        }
    }
}

/// Cloneable handle on the shared monitor state.
#[derive(Clone, Default)]
pub struct Monitor {
    state: Arc<Mutex<State>>,
    control: Option<Arc<dyn JobControl>>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets clients submit, cancel and query jobs through `control`.
    pub fn with_control(mut self, control: Arc<dyn JobControl>) -> Self {
        self.control = Some(control);
        self
    }

    /// Registers a client, its messages arrive on the returned connection.
    pub fn connect(&self) -> Connection {
        let (tx, rx) = channel(CLIENT_BACKLOG);
        let mut state = self.state.lock().unwrap();
        let id = state.next_client;
        state.next_client += 1;
        state.clients.insert(
            id,
            Client {
                tx,
                sessions: FxHashSet::default(),
            },
        );
        Connection {
            id,
            monitor: self.clone(),
            rx,
        }
    }

    pub fn update_metrics(&self, session: &str, update: &MetricsUpdate) {
        let mut state = self.state.lock().unwrap();
        state.session(session).metrics.apply(update);
    }

    pub fn metrics(&self, session: &str) -> Option<SessionMetrics> {
        self.state.lock().unwrap().snapshot(session)
    }

    pub fn notify_crash(&self, session: &str, data: serde_json::Value) -> usize {
        self.notify(MessageKind::Crash, session, data)
    }

    pub fn notify_coverage_increase(&self, session: &str, data: serde_json::Value) -> usize {
        self.notify(MessageKind::CoverageIncrease, session, data)
    }

    /// Discrete session event, e.g. start or end of a fuzz job.
    pub fn notify_event(&self, session: &str, data: serde_json::Value) -> usize {
        self.notify(MessageKind::Event, session, data)
    }

    fn notify(&self, kind: MessageKind, session: &str, data: serde_json::Value) -> usize {
        let msg = ServerMessage::new(kind, Some(session), data);
        self.state.lock().unwrap().publish(session, &msg)
    }

    /// Drops a finished session's metrics, subscriptions stay in place.
    pub fn end_session(&self, session: &str) {
        let mut state = self.state.lock().unwrap();
        state.sessions.remove(session);
    }

    /// Pushes fresh metrics of every subscribed session, returns messages sent.
    pub fn tick(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let watched = state
            .clients
            .values()
            .flat_map(|c| c.sessions.iter().cloned())
            .collect::<FxHashSet<_>>();
        let mut sent = 0;
        for session in watched {
            if let Some(m) = state.snapshot(&session) {
                let data = serde_json::to_value(&m).unwrap_or_default();
                let msg = ServerMessage::new(MessageKind::Metrics, Some(&session), data);
                sent += state.publish(&session, &msg);
            }
        }
        sent
    }

    pub fn clients(&self) -> usize {
        self.state.lock().unwrap().clients.len()
    }

    fn handle(&self, client: u64, msg: ClientMessage) {
        let reply = match msg {
            ClientMessage::Subscribe { session_id } => {
                let mut state = self.state.lock().unwrap();
                if let Some(c) = state.clients.get_mut(&client) {
                    c.sessions.insert(session_id.clone());
                }
                // Current metrics right away, the next tick is up to a period off.
                let snapshot = state.snapshot(&session_id);
                snapshot.map(|m| {
                    let data = serde_json::to_value(&m).unwrap_or_default();
                    ServerMessage::new(MessageKind::Metrics, Some(&session_id), data)
                })
            }
            ClientMessage::Unsubscribe { session_id } => {
                let mut state = self.state.lock().unwrap();
                if let Some(c) = state.clients.get_mut(&client) {
                    c.sessions.remove(&session_id);
                }
                None
            }
            ClientMessage::Ping { session_id } => Some(ServerMessage::new(
                MessageKind::Pong,
                session_id.as_deref(),
                serde_json::Value::Null,
            )),
            ClientMessage::Submit { job } => Some(self.control(|c| {
                let id = c.submit(job)?;
                Ok(c.job(&id).map_or_else(|| json!({ "jobId": id }), |j| job_summary(&j)))
            })),
            ClientMessage::Cancel { job_id } => Some(self.control(|c| {
                let cancelled = c.cancel(&job_id)?;
                let mut data = match c.job(&job_id) {
                    Some(j) => job_summary(&j),
                    None => json!({ "jobId": job_id }),
                };
                data["cancelled"] = json!(cancelled);
                Ok(data)
            })),
            ClientMessage::Status { job_id } => Some(self.control(|c| {
                c.job(&job_id)
                    .map(|j| job_summary(&j))
                    .ok_or_else(|| QueueError::NotFound(job_id.clone()))
            })),
        };
        if let Some(reply) = reply {
            self.state.lock().unwrap().reply(client, reply);
        }
    }

    /// Runs a job operation outside the state lock and wraps its answer.
    fn control<F>(&self, op: F) -> ServerMessage
    where
        F: FnOnce(&dyn JobControl) -> Result<serde_json::Value, QueueError>,
    {
        let control = match self.control.as_ref() {
            Some(c) => c,
            None => return ServerMessage::error("job control is not enabled on this monitor"),
        };
        match op(&**control) {
            Ok(data) => {
                let session = data["jobId"].as_str().map(str::to_string);
                ServerMessage::new(MessageKind::Job, session.as_deref(), data)
            }
            Err(e) => ServerMessage::error(e),
        }
    }

    fn disconnect(&self, client: u64) {
        self.state.lock().unwrap().clients.remove(&client);
    }
}

/// One client's end of the monitor, unregistered on drop.
pub struct Connection {
    id: u64,
    monitor: Monitor,
    rx: Receiver<ServerMessage>,
}

impl Connection {
    pub fn handle(&self, msg: ClientMessage) {
        self.monitor.handle(self.id, msg)
    }

    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.monitor.disconnect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzz::FuzzOptions;

    fn drain(c: &mut Connection) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Some(m) = c.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn only_subscribed_sessions_are_delivered() {
        let m = Monitor::new();
        let mut a = m.connect();
        let mut b = m.connect();
        a.handle(ClientMessage::Subscribe {
            session_id: "s1".into(),
        });
        b.handle(ClientMessage::Subscribe {
            session_id: "s2".into(),
        });
        m.update_metrics(
            "s1",
            &MetricsUpdate {
                crashes: Some(2),
                ..MetricsUpdate::default()
            },
        );
        m.update_metrics("s2", &MetricsUpdate::default());
        m.update_metrics("s3", &MetricsUpdate::default());
        assert_eq!(m.tick(), 2);

        let got = drain(&mut a);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageKind::Metrics);
        assert_eq!(got[0].session_id.as_deref(), Some("s1"));
        assert_eq!(got[0].data["crashes"], json!(2));
        assert_eq!(drain(&mut b)[0].session_id.as_deref(), Some("s2"));
    }

    #[test]
    fn events_are_immediate_and_unsubscribe_stops_delivery() {
        let m = Monitor::new();
        let mut c = m.connect();
        c.handle(ClientMessage::Subscribe {
            session_id: "job".into(),
        });
        assert_eq!(m.notify_crash("job", json!({"signal": "SIGSEGV"})), 1);
        assert_eq!(m.notify_coverage_increase("other", json!({})), 0);
        let got = drain(&mut c);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageKind::Crash);

        c.handle(ClientMessage::Unsubscribe {
            session_id: "job".into(),
        });
        m.update_metrics("job", &MetricsUpdate::default());
        assert_eq!(m.notify_crash("job", json!({})), 0);
        assert_eq!(m.tick(), 0);
        c.handle(ClientMessage::Ping { session_id: None });
        let got = drain(&mut c);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageKind::Pong);
        assert_eq!(m.clients(), 1);
    }

    #[test]
    fn subscribe_sends_current_metrics() {
        let m = Monitor::new();
        m.update_metrics(
            "s",
            &MetricsUpdate {
                coverage: Some(12),
                ..MetricsUpdate::default()
            },
        );
        let mut c = m.connect();
        c.handle(ClientMessage::Subscribe {
            session_id: "s".into(),
        });
        let got = drain(&mut c);
        assert_eq!(got[0].data["coverage"], json!(12));
        assert_eq!(m.metrics("s").unwrap().coverage, 12);
        m.end_session("s");
        assert!(m.metrics("s").is_none());
    }

    #[test]
    fn dropped_connections_unregister() {
        let m = Monitor::new();
        let c = m.connect();
        assert_eq!(m.clients(), 1);
        drop(c);
        assert_eq!(m.clients(), 0);
    }

    #[test]
    fn slow_clients_are_dropped() {
        let m = Monitor::new();
        let mut c = m.connect();
        c.handle(ClientMessage::Subscribe {
            session_id: "s".into(),
        });
        for _ in 0..CLIENT_BACKLOG {
            assert_eq!(m.notify_event("s", json!({})), 1);
        }
        assert_eq!(m.notify_event("s", json!({})), 0);
        assert_eq!(m.clients(), 0);
        // What was queued before the drop is still delivered.
        assert_eq!(drain(&mut c).len(), CLIENT_BACKLOG);
    }

    fn python_job(priority: u8) -> FuzzJob {
        FuzzJob::new(
            "t1",
            "print(input())",
            "python",
            vec!["a".into()],
            FuzzOptions {
                priority,
                ..FuzzOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn submit_cancel_and_status() {
        let q = Arc::new(JobQueue::in_memory());
        let m = Monitor::new().with_control(q.clone());
        let mut c = m.connect();

        c.handle(ClientMessage::Submit {
            job: python_job(7),
        });
        let got = drain(&mut c);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageKind::Job);
        let id = got[0].data["jobId"].as_str().unwrap().to_string();
        assert_eq!(got[0].session_id.as_deref(), Some(id.as_str()));
        assert_eq!(got[0].data["status"], json!("pending"));
        assert_eq!(got[0].data["kind"], json!("fuzz"));
        assert_eq!(q.get_job(&id).unwrap().priority, 7);

        c.handle(ClientMessage::Status { job_id: id.clone() });
        assert_eq!(drain(&mut c)[0].data["status"], json!("pending"));

        c.handle(ClientMessage::Cancel { job_id: id.clone() });
        let got = drain(&mut c);
        assert_eq!(got[0].data["cancelled"], json!(true));
        assert_eq!(got[0].data["status"], json!("cancelled"));

        c.handle(ClientMessage::Status {
            job_id: "missing".into(),
        });
        assert_eq!(drain(&mut c)[0].kind, MessageKind::Error);

        let mut bad = python_job(5);
        bad.options.priority = 0;
        c.handle(ClientMessage::Submit { job: bad });
        let got = drain(&mut c);
        assert_eq!(got[0].kind, MessageKind::Error);
        assert_eq!(q.stats().pending, 0);
    }

    #[test]
    fn job_messages_need_control() {
        let m = Monitor::new();
        let mut c = m.connect();
        c.handle(ClientMessage::Submit {
            job: python_job(5),
        });
        assert_eq!(drain(&mut c)[0].kind, MessageKind::Error);
    }

    #[test]
    fn wire_format() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","sessionId":"abc"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                session_id: "abc".into()
            }
        );
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientMessage::Ping { session_id: None });
        let cancel: ClientMessage =
            serde_json::from_str(r#"{"type":"cancel","jobId":"j1"}"#).unwrap();
        assert_eq!(
            cancel,
            ClientMessage::Cancel {
                job_id: "j1".into()
            }
        );
        let submit: ClientMessage = serde_json::from_str(
            r#"{"type":"submit","job":{"target_id":"t","code":"cat","language":"shell"}}"#,
        )
        .unwrap();
        match submit {
            ClientMessage::Submit { job } => {
                assert_eq!(job.language, crate::exec::Language::Shell);
                assert_eq!(job.options, FuzzOptions::default());
            }
            other => panic!("unexpected {:?}", other),
        }

        let out = ServerMessage::new(MessageKind::CoverageIncrease, Some("abc"), json!(1));
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["type"], json!("coverageIncrease"));
        assert_eq!(v["sessionId"], json!("abc"));
        assert!(v["timestamp"].is_string());
    }
}
