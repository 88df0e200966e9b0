//! SpoolQueueClient - ディレクトリを使ったローカル開発用のキュー
//!
//! # レイアウト
//! ```text
//! <root>/<store|default>/<queue>/<ulid>.msg                    待機中
//! <root>/<store|default>/<queue>/<ulid>.<claimed_ms>.inflight  受信済み・未確定
//! <root>/<store|default>/<queue>.error/<ulid>.msg              handle_error 済み・読めない本文
//! ```
//! ULID のファイル名順 = おおよその到着順。delivery tag は `<ulid>.<claimed_ms>`。
//! ack は削除、reject は待機中に戻す、handle_error は `.error` キューへ移す。
//! visibility timeout を過ぎた in-flight は receive / count の前に待機中へ戻す（at-least-once）。

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::domain::{ReceivedMessage, Result, WorkerError};
use crate::ports::{MetricsReader, MetricsRequest, QueueClient};

/// Adapter name the spool answers to in `[queues.adapters]`.
pub const SPOOL_ADAPTER: &str = "spool";

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

const DEFAULT_STORE_DIR: &str = "default";
const PENDING_EXT: &str = "msg";
const INFLIGHT_EXT: &str = "inflight";
const ERROR_QUEUE_SUFFIX: &str = ".error";

#[derive(Debug, Clone)]
pub struct SpoolQueueClient {
    root: PathBuf,
    store: Option<String>,
    visibility_timeout: Duration,
}

impl SpoolQueueClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            store: None,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    /// Store this client receives from and publishes to.
    pub fn with_store(mut self, store: Option<String>) -> Self {
        self.store = store;
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    fn queue_dir(&self, store: Option<&str>, queue_name: &str) -> PathBuf {
        self.root
            .join(store.unwrap_or(DEFAULT_STORE_DIR))
            .join(queue_name)
    }

    fn own_queue_dir(&self, queue_name: &str) -> PathBuf {
        self.queue_dir(self.store.as_deref(), queue_name)
    }

    /// Enqueues `body`; returns its message id.
    pub async fn publish(&self, queue_name: &str, body: &str) -> Result<String> {
        let dir = self.own_queue_dir(queue_name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| io_error("create", &dir, err))?;
        let id = Ulid::new().to_string();
        let path = message_path(&dir, &id, PENDING_EXT);
        tokio::fs::write(&path, body)
            .await
            .map_err(|err| io_error("write", &path, err))?;
        Ok(id)
    }

    /// Pending (not in-flight) messages of one queue, after expired claims went back.
    pub async fn count(&self, store: Option<&str>, queue_name: &str) -> Result<u64> {
        let dir = self.queue_dir(store, queue_name);
        self.requeue_expired(&dir).await?;
        Ok(file_stems(&dir, PENDING_EXT).await?.len() as u64)
    }

    /// Moves in-flight messages claimed longer than the visibility timeout ago back to pending.
    async fn requeue_expired(&self, dir: &Path) -> Result<usize> {
        let now_ms = Utc::now().timestamp_millis();
        let timeout_ms = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);

        let mut requeued = 0;
        for tag in file_stems(dir, INFLIGHT_EXT).await? {
            let Some(claimed_at_ms) = claimed_at_ms(&tag) else {
                continue;
            };
            if now_ms.saturating_sub(claimed_at_ms) < timeout_ms {
                continue;
            }
            let inflight = message_path(dir, &tag, INFLIGHT_EXT);
            let pending = message_path(dir, message_id(&tag), PENDING_EXT);
            match tokio::fs::rename(&inflight, &pending).await {
                Ok(()) => requeued += 1,
                // settled meanwhile
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error("requeue", &inflight, err)),
            }
        }
        if requeued > 0 {
            warn!(dir = %dir.display(), requeued, "requeued in-flight messages past their visibility timeout");
        }
        Ok(requeued)
    }

    /// Puts the messages claimed so far in this batch back to pending.
    async fn release(&self, dir: &Path, messages: &[ReceivedMessage]) {
        for tag in messages.iter().filter_map(|message| message.delivery_tag.as_deref()) {
            let inflight = message_path(dir, tag, INFLIGHT_EXT);
            let pending = message_path(dir, message_id(tag), PENDING_EXT);
            if let Err(err) = tokio::fs::rename(&inflight, &pending).await {
                warn!(error = %err, path = %inflight.display(), "could not release claimed message");
            }
        }
    }

    async fn move_to_error_queue(&self, store: Option<&str>, queue_name: &str, inflight: &Path, tag: &str) -> Result<()> {
        let error_dir = self.queue_dir(store, &format!("{queue_name}{ERROR_QUEUE_SUFFIX}"));
        tokio::fs::create_dir_all(&error_dir)
            .await
            .map_err(|err| io_error("create", &error_dir, err))?;
        let target = message_path(&error_dir, message_id(tag), PENDING_EXT);
        tokio::fs::rename(inflight, &target)
            .await
            .map_err(|err| io_error("move to error queue", inflight, err))
    }

    fn inflight_path(&self, message: &ReceivedMessage) -> Result<(PathBuf, String)> {
        let tag = message.delivery_tag.as_deref().ok_or_else(|| {
            WorkerError::QueueClient(format!(
                "message from {} has no delivery tag",
                message.queue_name
            ))
        })?;
        let dir = self.queue_dir(message.store_name.as_deref(), &message.queue_name);
        Ok((message_path(&dir, tag, INFLIGHT_EXT), tag.to_string()))
    }
}

fn message_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    dir.join(format!("{stem}.{ext}"))
}

/// `<ulid>.<claimed_ms>` for a claim of message `<ulid>`.
fn claim_tag(id: &str, claimed_at_ms: i64) -> String {
    format!("{id}.{claimed_at_ms}")
}

fn message_id(tag: &str) -> &str {
    tag.split_once('.').map_or(tag, |(id, _)| id)
}

fn claimed_at_ms(tag: &str) -> Option<i64> {
    tag.split_once('.')?.1.parse().ok()
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> WorkerError {
    WorkerError::QueueClient(format!("{action} {}: {err}", path.display()))
}

/// Sorted stems of the files with `ext`; a missing directory has none.
async fn file_stems(dir: &Path, ext: &str) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error("list", dir, err)),
    };

    let mut stems = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| io_error("list", dir, err))?
    {
        let path = entry.path();
        if path.extension().is_some_and(|found| found == ext)
            && let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
        {
            stems.push(stem.to_string());
        }
    }
    stems.sort();
    Ok(stems)
}

#[async_trait]
impl QueueClient for SpoolQueueClient {
    /// `options` are accepted for interface parity; the spool has none.
    /// Bodies that are not UTF-8 go to the error queue. Any other failure puts the
    /// whole batch back before returning the error.
    async fn receive_messages(
        &self,
        queue_name: &str,
        chunk_size: usize,
        _options: &serde_json::Value,
    ) -> Result<Vec<ReceivedMessage>> {
        let dir = self.own_queue_dir(queue_name);
        self.requeue_expired(&dir).await?;

        let claimed_at = Utc::now().timestamp_millis();
        let mut messages = Vec::new();
        for id in file_stems(&dir, PENDING_EXT).await?.into_iter().take(chunk_size) {
            let tag = claim_tag(&id, claimed_at);
            let pending = message_path(&dir, &id, PENDING_EXT);
            let inflight = message_path(&dir, &tag, INFLIGHT_EXT);
            match tokio::fs::rename(&pending, &inflight).await {
                Ok(()) => {}
                // another consumer took it first
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    self.release(&dir, &messages).await;
                    return Err(io_error("claim", &pending, err));
                }
            }

            let bytes = match tokio::fs::read(&inflight).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    if let Err(restore_err) = tokio::fs::rename(&inflight, &pending).await {
                        warn!(error = %restore_err, path = %inflight.display(), "could not release claimed message");
                    }
                    self.release(&dir, &messages).await;
                    return Err(io_error("read", &inflight, err));
                }
            };
            let Ok(body) = String::from_utf8(bytes) else {
                warn!(queue = queue_name, id = %id, "message body is not UTF-8, moving it to the error queue");
                self.move_to_error_queue(self.store.as_deref(), queue_name, &inflight, &tag)
                    .await?;
                continue;
            };

            let mut message = ReceivedMessage::new(queue_name, body).with_delivery_tag(tag);
            message.store_name = self.store.clone();
            messages.push(message);
        }
        debug!(queue = queue_name, received = messages.len(), "received from spool");
        Ok(messages)
    }

    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<()> {
        let (inflight, _) = self.inflight_path(message)?;
        tokio::fs::remove_file(&inflight)
            .await
            .map_err(|err| io_error("acknowledge", &inflight, err))
    }

    async fn reject(&self, message: &ReceivedMessage) -> Result<()> {
        let (inflight, tag) = self.inflight_path(message)?;
        let dir = self.queue_dir(message.store_name.as_deref(), &message.queue_name);
        let pending = message_path(&dir, message_id(&tag), PENDING_EXT);
        tokio::fs::rename(&inflight, &pending)
            .await
            .map_err(|err| io_error("requeue", &inflight, err))
    }

    async fn handle_error(&self, message: &ReceivedMessage) -> Result<()> {
        let (inflight, tag) = self.inflight_path(message)?;
        self.move_to_error_queue(
            message.store_name.as_deref(),
            &message.queue_name,
            &inflight,
            &tag,
        )
        .await
    }
}

#[async_trait]
impl MetricsReader for SpoolQueueClient {
    fn is_applicable(&self, adapter_name: &str) -> bool {
        adapter_name == SPOOL_ADAPTER
    }

    async fn read(&self, request: &MetricsRequest) -> Result<u64> {
        self.count(request.store_name.as_deref(), &request.queue_name)
            .await
    }
}
