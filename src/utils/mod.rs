use std::{
    cmp::min,
    fs::{rename, File},
    io::{self, Write},
    path::Path,
    process::{Child, ExitStatus},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::sleep,
    time::{Duration, Instant},
};

pub mod io_bg;

/// Serde adapter storing bytes as a hex string.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Hex encoded sha1 of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Shared stop request, tripped by the signal handler or by `shutdown`.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_soon(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn stop_req(&self) {
        self.0.store(true, Ordering::Relaxed)
    }
}

/// Polls `child` until it exits or `timeout` elapses, calling `on_poll` between checks.
///
/// Returns `None` on timeout, the child is left running and must be killed by the caller.
pub fn wait_timeout(
    child: &mut Child,
    timeout: Duration,
    mut on_poll: impl FnMut(),
) -> io::Result<Option<ExitStatus>> {
    const MAX_DELTA: Duration = Duration::from_millis(10);

    let start = Instant::now();
    let mut delta = Duration::from_millis(1);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let waited = start.elapsed();
        if waited >= timeout {
            return Ok(None);
        }
        on_poll();
        sleep(min(delta, timeout - waited));
        if delta < MAX_DELTA {
            delta *= 2;
        }
    }
}

/// Writes `data` to a sibling temp file first, then renames it over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    rename(&tmp, path)
}

/// Milliseconds since unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
