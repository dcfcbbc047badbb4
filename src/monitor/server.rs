use super::{ClientMessage, Monitor, ServerMessage};
use anyhow::Context;
use std::{
    net::{SocketAddr, TcpListener as StdListener},
    thread::{self, JoinHandle},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    runtime::Builder,
    sync::watch,
    time::{interval, MissedTickBehavior},
};

/// Longest accepted request line, a client sending more is disconnected.
pub const MAX_REQUEST_LINE: usize = 64 * 1024;

/// Monitor transport running on its own thread with a single threaded runtime.
///
/// Clients send one json request per line and receive one json message per line.
pub struct MonitorServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl MonitorServer {
    pub fn spawn(monitor: Monitor, addr: &str, tick: Duration) -> anyhow::Result<Self> {
        let listener =
            StdListener::bind(addr).with_context(|| format!("failed to bind monitor on {}", addr))?;
        listener
            .set_nonblocking(true)
            .context("failed to set monitor listener nonblocking")?;
        let addr = listener.local_addr().context("monitor listener address")?;
        let rt = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to init monitor runtime")?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = thread::Builder::new()
            .name("sandfuzz-monitor".into())
            .spawn(move || {
                let ret = rt.block_on(run(monitor, listener, tick, shutdown_rx));
                if let Err(e) = ret {
                    log::warn!("monitor server stopped: {:#}", e);
                }
            })
            .context("failed to spawn monitor thread")?;
        log::info!("monitor listening on {}", addr);
        Ok(Self {
            addr,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting, closes client connections and joins the server thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for MonitorServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    monitor: Monitor,
    listener: StdListener,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::from_std(listener)?;
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                monitor.tick();
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::debug!("monitor: client {} connected", peer);
                    let monitor = monitor.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_client(monitor, stream, shutdown).await {
                            log::debug!("monitor: client {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => log::warn!("monitor: accept failed: {}", e),
            },
        }
    }
    Ok(())
}

async fn serve_client(
    monitor: Monitor,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut rd = BufReader::new(rd);
    let mut line = Vec::new();
    let mut conn = monitor.connect();
    loop {
        // Partial lines stay in `line` across iterations, bound the total.
        let room = (MAX_REQUEST_LINE + 1).saturating_sub(line.len()) as u64;
        let mut limited = (&mut rd).take(room);
        tokio::select! {
            _ = shutdown.changed() => break,
            read = limited.read_until(b'\n', &mut line) => {
                let n = read?;
                if line.len() > MAX_REQUEST_LINE {
                    let msg = format!("request line exceeds {} bytes", MAX_REQUEST_LINE);
                    write_msg(&mut wr, &ServerMessage::error(msg)).await?;
                    break;
                }
                if n == 0 {
                    break;
                }
                let text = String::from_utf8_lossy(&line).trim().to_string();
                line.clear();
                if text.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => conn.handle(msg),
                    Err(e) => {
                        write_msg(&mut wr, &ServerMessage::error(format!("bad request: {}", e))).await?;
                    }
                }
            }
            msg = conn.recv() => match msg {
                Some(m) => write_msg(&mut wr, &m).await?,
                None => break,
            },
        }
    }
    Ok(())
}

async fn write_msg(wr: &mut OwnedWriteHalf, msg: &ServerMessage) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    wr.write_all(&line).await
}
