use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Result};
use fs4::tokio::AsyncFileExt;
use serde_json::Value;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, info, warn};

/// Pause between attempts to take a lock someone else holds.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Durable queue for telemetry payloads produced while the remote service is unreachable.
/// Every payload is one JSON document on its own line.
///
/// Appends and drains hold an exclusive lock on the file for their whole duration and only
/// ever touch the file currently linked at `path`, so a payload is either in a drain's result
/// or still in the log, never in an unlinked file.
pub struct PayloadLog {
    path: PathBuf,
}

impl PayloadLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Appends a single payload. The file is created on demand.
    pub async fn append(&self, payload: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(payload)?;
        line.push(b'\n');

        let Some(mut file) = self.open_locked(true).await? else {
            bail!("Unable to create payload log {:?}", self.path);
        };
        let result = async {
            file.write_all(&line).await?;
            file.flush().await
        }
        .await;
        file.unlock_async().await?;
        result?;

        debug!("Queued payload into {:?}", self.path);
        Ok(())
    }

    /// Destructively reads the whole log. The file is deleted right after it's read, before
    /// any of the payloads are submitted anywhere, so each payload gets at most one delivery
    /// attempt. Lines that aren't valid JSON are dropped.
    pub async fn drain_all(&self) -> Result<Vec<Value>> {
        let Some(mut file) = self.open_locked(false).await? else {
            return Ok(vec![]);
        };

        // Read and unlink under the same lock, appends wait for it and then start a new file.
        let result = async {
            let mut content = String::new();
            file.read_to_string(&mut content).await?;
            fs::remove_file(&self.path).await?;
            io::Result::Ok(content)
        }
        .await;
        file.unlock_async().await?;
        let content = result?;

        let payloads = parse_payloads(&self.path, &content);
        info!("Drained {} payloads from {:?}", payloads.len(), self.path);
        Ok(payloads)
    }

    /// Number of non-empty lines currently queued.
    pub async fn len(&self) -> Result<usize> {
        Ok(self
            .read_content()
            .await?
            .map(|content| content.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0))
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    async fn read_content(&self) -> Result<Option<String>> {
        async fn extract(path: &Path) -> io::Result<String> {
            let mut file = File::open(path).await?;
            wait_for_lock(|| file.try_lock_shared()).await?;
            let mut content = String::new();
            let result = file.read_to_string(&mut content).await;
            file.unlock_async().await?;
            result?;
            Ok(content)
        }

        match extract(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)?,
        }
    }

    /// Opens the log and takes its exclusive lock. When a drain unlinked the file between the
    /// open and the lock, the handle is dropped and the log opened again. `None` if there is no
    /// log and `create` isn't set.
    async fn open_locked(&self, create: bool) -> io::Result<Option<File>> {
        loop {
            let file = match File::options()
                .read(true)
                .append(true)
                .create(create)
                .open(&self.path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            };
            wait_for_lock(|| file.try_lock_exclusive()).await?;

            if is_linked_at(&file, &self.path).await? {
                return Ok(Some(file));
            }
            debug!("Log {:?} was replaced while waiting for its lock", self.path);
            file.unlock_async().await?;
        }
    }
}

/// Polls `try_lock` so a contended lock never blocks the runtime thread.
async fn wait_for_lock(try_lock: impl Fn() -> io::Result<()>) -> io::Result<()> {
    let contended = fs4::lock_contended_error().raw_os_error();
    loop {
        match try_lock() {
            Err(e) if e.raw_os_error() == contended => {
                tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
            }
            result => return result,
        }
    }
}

/// Whether `file` is still the file found at `path`.
async fn is_linked_at(file: &File, path: &Path) -> io::Result<bool> {
    let linked = match fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let opened = file.metadata().await?;

    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::fs::MetadataExt;
            Ok(opened.dev() == linked.dev() && opened.ino() == linked.ino())
        } else {
            // Windows keeps a locked file in place, existence is all that can change.
            let _ = (opened, linked);
            Ok(true)
        }
    }
}

fn parse_payloads(path: &Path, content: &str) -> Vec<Value> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(Value::Null) => None,
            Ok(v) => Some(v),
            Err(e) => {
                // Might happen when a write was cut off by a shutdown.
                warn!("Dropping illegal json line in {path:?} {line}: {e}");
                None
            }
        })
        .collect()
}
