use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const POLL: Duration = Duration::from_millis(100);

/// Counters shared between the copying thread and whoever reports on it.
#[derive(Debug, Default)]
pub struct Progress {
    written: AtomicU64,
    done: AtomicBool,
}

impl Progress {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Makes every further write through the attached writer fail.
    pub fn finish(&self) {
        self.done.store(true, Ordering::Relaxed);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }
}

/// Counts bytes into a shared [`Progress`] and refuses writes once it is done.
pub struct ProgressWriter<W> {
    inner: W,
    progress: Arc<Progress>,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new(inner: W, progress: Arc<Progress>) -> Self {
        Self { inner, progress }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.progress.is_done() {
            // Not `Interrupted`: io::copy would retry that forever.
            return Err(io::Error::other("copy stopped"));
        }
        let n = self.inner.write(buf)?;
        self.progress.written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub written: u64,
    /// Expected total, 0 when unknown.
    pub total: u64,
    pub bytes_per_sec: f64,
}

impl Sample {
    pub fn percent(&self) -> Option<f64> {
        (self.total > 0).then(|| (self.written as f64 / self.total as f64 * 100.0).min(100.0))
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", human_bytes(self.written))?;
        if let Some(pct) = self.percent() {
            write!(f, " of {} ({pct:.0}%)", human_bytes(self.total))?;
        }
        write!(f, ", {:.1} MB/s", self.bytes_per_sec / 1_000_000.0)
    }
}

pub fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1000.0 && unit < UNITS.len() - 1 {
        v /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{v:.1} {}", UNITS[unit])
    }
}

/// Copies `reader` into `writer` on a background thread and calls `on_tick`
/// every `interval` until the copy ends. Setting `cancel` stops the copy at
/// the next write. Returns the byte count and the writer.
pub fn copy_with_progress<R, W, F>(
    reader: R,
    writer: W,
    total: u64,
    cancel: &AtomicBool,
    interval: Duration,
    mut on_tick: F,
) -> Result<(u64, W)>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
    F: FnMut(Sample),
{
    let progress = Arc::new(Progress::default());
    let (tx, rx) = mpsc::channel();
    let worker_progress = progress.clone();
    let handle = std::thread::spawn(move || {
        let mut reader = reader;
        let mut pw = ProgressWriter::new(writer, worker_progress);
        let res = io::copy(&mut reader, &mut pw).and_then(|n| pw.flush().map(|_| n));
        let _ = tx.send(res);
        pw.into_inner()
    });

    let started = Instant::now();
    let mut last_tick = started;
    let mut last_written = 0u64;
    let mut cancelled = false;
    let res = loop {
        match rx.recv_timeout(POLL) {
            Ok(res) => break res,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                break Err(io::Error::other("copy thread exited unexpectedly"));
            }
        }
        if !cancelled && cancel.load(Ordering::Relaxed) {
            cancelled = true;
            progress.finish();
        }
        let now = Instant::now();
        if !cancelled && now.duration_since(last_tick) >= interval {
            let written = progress.written();
            let secs = now.duration_since(last_tick).as_secs_f64();
            on_tick(Sample {
                written,
                total,
                bytes_per_sec: written.saturating_sub(last_written) as f64 / secs,
            });
            last_tick = now;
            last_written = written;
        }
    };
    progress.finish();

    let writer = handle
        .join()
        .map_err(|_| Error::msg("copy thread panicked"))?;
    if cancelled {
        return Err(Error::cancelled());
    }
    let n = res.map_err(|e| Error::msg(format!("copy failed: {e}")))?;
    tracing::debug!(bytes = n, elapsed_ms = started.elapsed().as_millis() as u64, "copy finished");
    Ok((n, writer))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowReader {
        left: usize,
    }

    impl Read for SlowReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.left == 0 {
                return Ok(0);
            }
            std::thread::sleep(Duration::from_millis(20));
            let n = buf.len().min(self.left).min(4096);
            buf[..n].fill(0xA5);
            self.left -= n;
            Ok(n)
        }
    }

    #[test]
    fn copies_everything_and_returns_writer() {
        let data: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let cancel = AtomicBool::new(false);
        let (n, out) = copy_with_progress(
            io::Cursor::new(data.clone()),
            Vec::new(),
            data.len() as u64,
            &cancel,
            Duration::from_secs(60),
            |_| {},
        )
        .unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn cancel_stops_copy_early() {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            flag.store(true, Ordering::Relaxed);
        });
        let err = copy_with_progress(
            SlowReader { left: 64 * 1024 * 1024 },
            io::sink(),
            0,
            &cancel,
            Duration::from_secs(60),
            |_| {},
        )
        .unwrap_err();
        assert!(err.is_cancelled(), "unexpected err: {err}");
    }

    #[test]
    fn writes_fail_once_done() {
        let progress = Arc::new(Progress::default());
        let mut w = ProgressWriter::new(Vec::new(), progress.clone());
        w.write_all(b"abc").unwrap();
        progress.finish();
        assert!(w.write_all(b"d").is_err());
        assert_eq!(progress.written(), 3);
    }

    #[test]
    fn sample_formats_percent_when_total_known() {
        let s = Sample {
            written: 500_000_000,
            total: 2_000_000_000,
            bytes_per_sec: 25_000_000.0,
        };
        assert_eq!(s.to_string(), "500.0 MB of 2.0 GB (25%), 25.0 MB/s");
        let unknown = Sample { total: 0, ..s };
        assert_eq!(unknown.to_string(), "500.0 MB, 25.0 MB/s");
    }
}
