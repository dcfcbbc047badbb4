//! Background readers for child process pipes.

use std::{
    io::Read,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::sleep,
    time::{Duration, Instant},
};

/// Bytes kept per stream, the rest is read and dropped.
pub const OUTPUT_CAP: usize = 1 << 20;

/// Output of one stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub data: Vec<u8>,
    /// More than the cap was written.
    pub truncated: bool,
}

pub fn read_background<R: Read + Send + 'static>(f: R) -> BackgroundIoHandle {
    read_background_capped(f, OUTPUT_CAP)
}

/// Drains `f` on its own thread, keeping at most `cap` bytes. The pipe is read
/// until EOF even past the cap so the writer never blocks.
pub fn read_background_capped<R: Read + Send + 'static>(mut f: R, cap: usize) -> BackgroundIoHandle {
    let buf = Arc::new(Mutex::new(Vec::with_capacity(4096.min(cap))));
    let finished = Arc::new(AtomicBool::new(false));
    let truncated = Arc::new(AtomicBool::new(false));
    let buf1 = Arc::clone(&buf);
    let finished1 = Arc::clone(&finished);
    let truncated1 = Arc::clone(&truncated);

    std::thread::spawn(move || {
        let mut buf = vec![0_u8; 1024 * 64].into_boxed_slice();
        while let Ok(sz) = f.read(&mut buf[..]) {
            if sz == 0 {
                break;
            }
            let mut shared_buf = buf1.lock().unwrap();
            let room = cap.saturating_sub(shared_buf.len());
            if sz > room {
                truncated1.store(true, Ordering::Release);
            }
            shared_buf.extend(&buf[..sz.min(room)]);
        }
        finished1.store(true, Ordering::Release);
    });

    BackgroundIoHandle {
        buf,
        finished,
        truncated,
    }
}

pub struct BackgroundIoHandle {
    buf: Arc<Mutex<Vec<u8>>>,
    finished: Arc<AtomicBool>,
    truncated: Arc<AtomicBool>,
}

impl BackgroundIoHandle {
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated.load(Ordering::Acquire)
    }

    /// Waits at most `max_wait` for EOF, then returns whatever was kept.
    pub fn wait_finish(self, max_wait: Duration) -> Captured {
        let start = Instant::now();
        while !self.is_finished() && start.elapsed() < max_wait {
            sleep(Duration::from_millis(1));
        }
        let data = self.buf.lock().unwrap().split_off(0);
        Captured {
            data,
            truncated: self.is_truncated(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_all() {
        let data = b"hello sandbox".to_vec();
        let h = read_background(Cursor::new(data.clone()));
        let out = h.wait_finish(Duration::from_secs(5));
        assert_eq!(out.data, data);
        assert!(!out.truncated);
    }

    #[test]
    fn output_is_capped() {
        let data = vec![b'a'; 64 * OUTPUT_CAP];
        let h = read_background(Cursor::new(data));
        let out = h.wait_finish(Duration::from_secs(30));
        assert_eq!(out.data.len(), OUTPUT_CAP);
        assert!(out.truncated);
    }

    #[test]
    fn exact_cap_is_not_truncated() {
        let h = read_background_capped(Cursor::new(vec![7_u8; 100]), 100);
        let out = h.wait_finish(Duration::from_secs(5));
        assert_eq!(out.data.len(), 100);
        assert!(!out.truncated);
    }
}
