//! The HTTP/1.1 client's append-only request log, one line per completed
//! task, plus the periodic/size-free roll discipline described for
//! `logroll`/`logrollhour`/`logrollonsignal`.
//!
//! Wire format: `<timestamp> <thread-name> <status-or-408> <method> <url>
//! <sec>.<usec> <bytes-sent> <bytes-received> <reused 0|1> <cause>`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use time::macros::format_description;
use time::OffsetDateTime;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::PerServerConfig;

/// One completed task's entry, independent of its eventual `cause`
/// column so a caller building it doesn't need to know the log's wire
/// format.
pub struct LogEntry<'a> {
    pub thread_name: &'a str,
    /// Status 0 (task never got a response) is written as `408`.
    pub status: u16,
    pub method: &'a str,
    pub url: &'a str,
    pub elapsed: Duration,
    pub sent: u64,
    pub received: u64,
    pub reused: bool,
    pub cause: &'static str,
}

/// A per-`PerServerConfig` append-only log file. `None` (`logging =
/// false`, or no `logfile` configured) makes every `write_line` call a
/// no-op, matching the original's "logging off" fast path.
pub struct ClientLog {
    inner: Mutex<Option<Inner>>,
    logrollfmt: Option<String>,
    logmaxbackup: u32,
}

struct Inner {
    path: PathBuf,
    file: File,
}

impl ClientLog {
    /// Opens (creating/appending) the configured logfile, or builds an
    /// inert instance when logging is disabled.
    pub async fn open(cfg: &PerServerConfig) -> std::io::Result<Self> {
        let inner = match (&cfg.logfile, cfg.logging) {
            (Some(path), true) => Some(open_append(path).await?),
            _ => None,
        };
        Ok(Self {
            inner: Mutex::new(inner),
            logrollfmt: cfg.logrollfmt.clone(),
            logmaxbackup: cfg.logmaxbackup,
        })
    }

    pub async fn write_line(&self, entry: &LogEntry<'_>) {
        let mut guard = self.inner.lock().await;
        let Some(inner) = guard.as_mut() else {
            return;
        };
        let line = format_line(entry);
        if let Err(e) = inner.file.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, path = %inner.path.display(), "failed writing http client log line");
        }
    }

    /// Rolls the current logfile to a timestamped backup and reopens a
    /// fresh one, trimming backups beyond `logmaxbackup`. A no-op when
    /// logging is disabled.
    pub async fn roll(&self) -> std::io::Result<()> {
        let mut guard = self.inner.lock().await;
        let Some(inner) = guard.as_mut() else {
            return Ok(());
        };
        let suffix = self
            .logrollfmt
            .clone()
            .unwrap_or_else(|| "%Y-%m-%d-%H-%M-%S".to_string());
        let stamp = format_roll_suffix(&suffix);
        let backup = inner.path.with_file_name(format!(
            "{}.{}",
            inner.path.file_name().and_then(|n| n.to_str()).unwrap_or("http-client.log"),
            stamp
        ));
        tokio::fs::rename(&inner.path, &backup).await?;
        inner.file = open_file(&inner.path).await?;
        prune_backups(&inner.path, self.logmaxbackup).await?;
        Ok(())
    }
}

async fn open_append(path: &Path) -> std::io::Result<Inner> {
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(Inner { path: path.to_path_buf(), file })
}

async fn open_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

/// Best-effort `strftime`-lite substitution; only the fields the original
/// config option documents (`%Y %m %d %H %M %S`) are supported, since
/// `logrollfmt` is a config-file string, not attacker input.
fn format_roll_suffix(fmt: &str) -> String {
    let now = OffsetDateTime::now_utc();
    fmt.replace("%Y", &format!("{:04}", now.year()))
        .replace("%m", &format!("{:02}", u8::from(now.month())))
        .replace("%d", &format!("{:02}", now.day()))
        .replace("%H", &format!("{:02}", now.hour()))
        .replace("%M", &format!("{:02}", now.minute()))
        .replace("%S", &format!("{:02}", now.second()))
}

/// Removes the oldest rolled backups beyond `logmaxbackup`, named
/// `<logfile>.<suffix>` in the same directory as `path`.
async fn prune_backups(path: &Path, logmaxbackup: u32) -> std::io::Result<()> {
    let Some(dir) = path.parent() else { return Ok(()) };
    let Some(stem) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(());
    };
    let prefix = format!("{stem}.");
    let mut backups = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(&prefix) {
                backups.push(entry.path());
            }
        }
    }
    backups.sort();
    let overflow = backups.len().saturating_sub(logmaxbackup as usize);
    for old in backups.into_iter().take(overflow) {
        let _ = tokio::fs::remove_file(old).await;
    }
    Ok(())
}

fn format_line(entry: &LogEntry<'_>) -> String {
    let format = format_description!("[day]/[month repr:short]/[year]:[hour]:[minute]:[second]");
    let now = OffsetDateTime::now_utc();
    let timestamp = now.format(&format).unwrap_or_else(|_| now.unix_timestamp().to_string());
    let status = if entry.status == 0 { 408 } else { entry.status };
    format!(
        "{} {} {} {} {} {}.{:06} {} {} {} {}\n",
        timestamp,
        entry.thread_name,
        status,
        entry.method,
        entry.url,
        entry.elapsed.as_secs(),
        entry.elapsed.subsec_micros(),
        entry.sent,
        entry.received,
        entry.reused as u8,
        entry.cause,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_zero_status_as_408() {
        let entry = LogEntry {
            thread_name: "-conn:default:0:0-",
            status: 0,
            method: "GET",
            url: "https://example.test/",
            elapsed: Duration::from_millis(1500),
            sent: 100,
            received: 0,
            reused: false,
            cause: "tasktimeout",
        };
        let line = format_line(&entry);
        assert!(line.contains(" 408 GET https://example.test/ 1.500000 100 0 0 tasktimeout\n"));
    }

    #[test]
    fn formats_reused_flag_as_digit() {
        let entry = LogEntry {
            thread_name: "t",
            status: 200,
            method: "GET",
            url: "https://example.test/b",
            elapsed: Duration::from_micros(250),
            sent: 40,
            received: 512,
            reused: true,
            cause: "ok",
        };
        let line = format_line(&entry);
        assert!(line.contains(" 200 GET https://example.test/b 0.000250 40 512 1 ok\n"));
    }

    #[tokio::test]
    async fn disabled_logging_is_a_no_op() {
        let cfg = PerServerConfig::default();
        let log = ClientLog::open(&cfg).await.unwrap();
        log.write_line(&LogEntry {
            thread_name: "t",
            status: 200,
            method: "GET",
            url: "https://example.test/",
            elapsed: Duration::ZERO,
            sent: 0,
            received: 0,
            reused: false,
            cause: "ok",
        })
        .await;
        log.roll().await.unwrap();
    }
}
