use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use http::{Method, StatusCode, Version};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

/// One line of the access log, emitted per forwarded HTTP request.
#[derive(Debug)]
pub struct LogEntry {
    pub start: DateTime<Utc>,
    pub method: Method,
    pub authority: String,
    pub path: String,
    pub proto: Version,
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub backend_elapsed: Duration,
    pub total_elapsed: Duration,
    pub set_id: String,
    pub backend_index: usize,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} \"{} {} {} {:?}\" {} ",
            self.start.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.method,
            self.authority,
            self.path,
            self.proto,
            self.status.as_u16(),
        )?;
        match self.content_length {
            Some(length) => write!(f, "{length}")?,
            None => f.write_str("-")?,
        }
        write!(
            f,
            " {:.3} {:.3} {} {}",
            self.backend_elapsed.as_secs_f64() * 1000.0,
            self.total_elapsed.as_secs_f64() * 1000.0,
            if self.set_id.is_empty() { "-" } else { &self.set_id },
            self.backend_index,
        )
    }
}

enum Message {
    Entry(Box<LogEntry>),
    Stop(oneshot::Sender<()>),
}

/// Asynchronous access-log sink. `message_raw` never blocks the request
/// path; a writer task drains the queue into a buffered appender and
/// flushes whenever the queue goes idle.
#[derive(Clone)]
pub struct AccessLog {
    tx: mpsc::UnboundedSender<Message>,
}

impl AccessLog {
    /// Opens the sink at `path`, appending to an existing file. The literal
    /// `none` disables logging entirely.
    pub async fn open(path: &str) -> std::io::Result<Option<Self>> {
        if path == "none" {
            return Ok(None);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_entries(BufWriter::new(file), rx));
        Ok(Some(Self { tx }))
    }

    pub fn message_raw(&self, entry: LogEntry) {
        let _ = self.tx.send(Message::Entry(Box::new(entry)));
    }

    /// Flushes queued entries and shuts the writer task down.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Message::Stop(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn write_entries(
    mut writer: BufWriter<tokio::fs::File>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        match rx.recv().await {
            Some(Message::Entry(entry)) => {
                let line = format!("{entry}\n");
                if let Err(err) = writer.write_all(line.as_bytes()).await {
                    error!(error = %err, "failed to write access log entry");
                    continue;
                }
                if rx.is_empty() {
                    if let Err(err) = writer.flush().await {
                        error!(error = %err, "failed to flush access log");
                    }
                }
            }
            Some(Message::Stop(ack)) => {
                let _ = writer.flush().await;
                let _ = ack.send(());
                break;
            }
            None => {
                let _ = writer.flush().await;
                break;
            }
        }
    }
}
