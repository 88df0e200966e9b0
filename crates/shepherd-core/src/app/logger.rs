//! Worker logging helpers on top of `tracing`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::Level;

use crate::app::context::WorkerContext;
use crate::domain::ReceivedMessage;
use crate::telemetry::QUEUE_ERRORS_TARGET;

pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Last firing time per named timer.
#[derive(Debug, Default)]
pub struct LogThrottle {
    last_logged: HashMap<String, DateTime<Utc>>,
}

impl LogThrottle {
    pub fn should_log(&mut self, key: &str, now: DateTime<Utc>, interval: Duration) -> bool {
        if let Some(last) = self.last_logged.get(key)
            && let Ok(elapsed) = (now - *last).to_std()
            && elapsed < interval
        {
            return false;
        }
        self.last_logged.insert(key.to_string(), now);
        true
    }
}

/// Rate-limited logger for the worker control loop.
///
/// The loop runs many cycles per second; per-cycle messages go through a named
/// timer so each one shows up at most once per interval.
pub struct WorkerLogger {
    ctx: Arc<WorkerContext>,
    interval: Duration,
}

impl WorkerLogger {
    pub fn new(ctx: Arc<WorkerContext>, interval: Duration) -> Self {
        Self { ctx, interval }
    }

    /// Returns whether the message was emitted.
    pub fn log_not_often_than(
        &self,
        timer: &str,
        level: Level,
        message: impl FnOnce() -> String,
    ) -> bool {
        self.log_every(timer, level, self.interval, message)
    }

    pub fn log_every(
        &self,
        timer: &str,
        level: Level,
        interval: Duration,
        message: impl FnOnce() -> String,
    ) -> bool {
        if !self.ctx.should_log(timer, interval) {
            return false;
        }
        emit(level, &message());
        true
    }
}

fn emit(level: Level, message: &str) {
    if level == Level::ERROR {
        tracing::error!("{message}");
    } else if level == Level::WARN {
        tracing::warn!("{message}");
    } else if level == Level::INFO {
        tracing::info!("{message}");
    } else if level == Level::DEBUG {
        tracing::debug!("{message}");
    } else {
        tracing::trace!("{message}");
    }
}

/// Reports processed messages that came back flagged with an error.
#[derive(Debug, Clone, Copy)]
pub struct QueueErrorLogger {
    enabled: bool,
}

impl QueueErrorLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Logs the report on the queue-errors target and returns it; `None` when nothing failed.
    pub fn log_failed_messages(
        &self,
        queue_name: &str,
        messages: &[ReceivedMessage],
    ) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let failed: Vec<&ReceivedMessage> = messages.iter().filter(|m| m.has_error).collect();
        if failed.is_empty() {
            return None;
        }

        let report = format_report(queue_name, &failed);
        tracing::error!(target: QUEUE_ERRORS_TARGET, queue = queue_name, failed = failed.len(), "{report}");
        Some(report)
    }
}

fn format_report(queue_name: &str, failed: &[&ReceivedMessage]) -> String {
    let mut lines = vec![format!(
        "[Queue Message Errors] Queue: {queue_name} | Failed messages: {}",
        failed.len()
    )];
    for (index, message) in failed.iter().enumerate() {
        lines.push(format!("Message #{}:", index + 1));
        lines.push(describe_body(&message.body));
    }
    lines.join("\n")
}

fn describe_body(body: &str) -> String {
    let Ok(serde_json::Value::Object(mut fields)) = serde_json::from_str::<serde_json::Value>(body)
    else {
        return format!("  Body: {body}");
    };
    let Some(error) = fields.remove("errorMessage") else {
        return format!("  Body: {body}");
    };

    let error = match error {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    };
    let remaining = serde_json::Value::Object(fields).to_string();
    format!("  Body: {remaining}\n  Error: {error}")
}
