//! Progress-event batcher: coalesces plan/step chatter per session into one
//! combined message per throttle window, keeping it out of the user's chat
//! log as separate lines.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

/// Lines buffered per window before dropping.
const MAX_BUFFERED_LINES: usize = 20;
/// Throttle window.
const FLUSH_WINDOW: Duration = Duration::from_secs(2);

/// One flushed batch, ready for the gateway to send.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressFlush {
    pub session_key: String,
    pub text: String,
}

#[derive(Default)]
struct Buffer {
    lines: Vec<String>,
    dropped: usize,
    flush_scheduled: bool,
}

/// Collects progress lines per session and emits one combined flush per
/// window through the channel handed to [`ProgressBatcher::new`].
///
/// Multiple producers within the window attach to the same pending flush
/// task; lines past the buffer cap are counted and summarized.
pub struct ProgressBatcher {
    buffers: Mutex<HashMap<String, Buffer>>,
    flush_tx: mpsc::UnboundedSender<ProgressFlush>,
    window: Duration,
}

impl ProgressBatcher {
    pub fn new(flush_tx: mpsc::UnboundedSender<ProgressFlush>) -> Arc<Self> {
        Self::with_window(flush_tx, FLUSH_WINDOW)
    }

    pub fn with_window(
        flush_tx: mpsc::UnboundedSender<ProgressFlush>,
        window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(HashMap::new()),
            flush_tx,
            window,
        })
    }

    /// Queue one progress line. The first line in a window schedules the
    /// flush task; later lines ride along.
    pub fn emit(self: &Arc<Self>, session_key: &str, line: &str) {
        let schedule = {
            let mut buffers = self.buffers.lock().unwrap();
            let buffer = buffers.entry(session_key.to_string()).or_default();

            if buffer.lines.len() >= MAX_BUFFERED_LINES {
                buffer.dropped += 1;
                warn!(session = %session_key, dropped = buffer.dropped, "progress line dropped");
            } else {
                buffer.lines.push(line.to_string());
            }

            if buffer.flush_scheduled {
                false
            } else {
                buffer.flush_scheduled = true;
                true
            }
        };

        if schedule {
            let batcher = Arc::clone(self);
            let key = session_key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(batcher.window).await;
                batcher.flush(&key);
            });
        }
    }

    fn flush(&self, session_key: &str) {
        let batch = {
            let mut buffers = self.buffers.lock().unwrap();
            let Some(buffer) = buffers.get_mut(session_key) else {
                return;
            };
            let lines = std::mem::take(&mut buffer.lines);
            let dropped = std::mem::take(&mut buffer.dropped);
            buffer.flush_scheduled = false;
            (lines, dropped)
        };

        let (lines, dropped) = batch;
        if lines.is_empty() && dropped == 0 {
            return;
        }

        let mut text = lines.join("\n");
        if dropped > 0 {
            text.push_str(&format!("\n… ({dropped} lines dropped)"));
        }

        let _ = self.flush_tx.send(ProgressFlush {
            session_key: session_key.to_string(),
            text,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_within_window_coalesce_into_one_flush() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let batcher = ProgressBatcher::with_window(tx, Duration::from_millis(30));

        batcher.emit("s1", "step 1");
        batcher.emit("s1", "step 2");
        batcher.emit("s1", "step 3");

        let flush = rx.recv().await.expect("flush");
        assert_eq!(flush.session_key, "s1");
        assert_eq!(flush.text, "step 1\nstep 2\nstep 3");

        // nothing further pending
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sessions_flush_independently() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let batcher = ProgressBatcher::with_window(tx, Duration::from_millis(20));

        batcher.emit("a", "from a");
        batcher.emit("b", "from b");

        let mut keys = vec![
            rx.recv().await.expect("first").session_key,
            rx.recv().await.expect("second").session_key,
        ];
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn overflow_is_counted_and_summarized() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let batcher = ProgressBatcher::with_window(tx, Duration::from_millis(30));

        for i in 0..25 {
            batcher.emit("s1", &format!("line {i}"));
        }

        let flush = rx.recv().await.expect("flush");
        assert_eq!(flush.text.lines().count(), MAX_BUFFERED_LINES + 1);
        assert!(flush.text.ends_with("… (5 lines dropped)"));
    }

    #[tokio::test]
    async fn new_window_opens_after_flush() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let batcher = ProgressBatcher::with_window(tx, Duration::from_millis(20));

        batcher.emit("s1", "first");
        let first = rx.recv().await.expect("first flush");
        assert_eq!(first.text, "first");

        batcher.emit("s1", "second");
        let second = rx.recv().await.expect("second flush");
        assert_eq!(second.text, "second");
    }
}
