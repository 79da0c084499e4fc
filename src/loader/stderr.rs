//! Worker stderr relay.
//!
//! Every line the worker writes to stderr becomes a `tracing` event; the
//! last few KiB are also kept so a startup failure can carry them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Bounded tail of a worker's stderr, shared with the relay task.
#[derive(Debug, Clone)]
pub struct StderrTail {
    inner: Arc<Mutex<Tail>>,
}

#[derive(Debug)]
struct Tail {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
}

impl StderrTail {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Tail {
                lines: VecDeque::new(),
                bytes: 0,
                limit,
            })),
        }
    }

    /// Start relaying `stream` until EOF.
    pub fn relay<R>(&self, stream: R, pid: u32) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tail = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        tracing::info!(target: "worker_loader::worker", pid, "{}", line);
                        tail.push(line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(pid, error = %e, "Worker stderr unreadable");
                        break;
                    }
                }
            }
        })
    }

    pub fn push(&self, line: String) {
        let mut tail = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if tail.limit == 0 {
            return;
        }
        tail.bytes += line.len() + 1;
        tail.lines.push_back(line);
        while tail.bytes > tail.limit && tail.lines.len() > 1 {
            if let Some(old) = tail.lines.pop_front() {
                tail.bytes -= old.len() + 1;
            }
        }
    }

    /// The retained lines joined with newlines.
    pub fn snapshot(&self) -> String {
        let tail = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tail.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest_lines() {
        let tail = StderrTail::new(16);
        tail.push("aaaaaa".to_string());
        tail.push("bbbbbb".to_string());
        tail.push("cccccc".to_string());
        assert_eq!(tail.snapshot(), "bbbbbb\ncccccc");
    }

    #[test]
    fn single_long_line_survives() {
        let tail = StderrTail::new(4);
        tail.push("a very long line".to_string());
        assert_eq!(tail.snapshot(), "a very long line");
    }

    #[tokio::test]
    async fn relay_collects_lines_until_eof() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let tail = StderrTail::new(1024);
        let task = tail.relay(reader, 42);

        use tokio::io::AsyncWriteExt;
        writer.write_all(b"loading app\nboom\n").await.unwrap();
        drop(writer);
        task.await.unwrap();

        assert_eq!(tail.snapshot(), "loading app\nboom");
    }
}
