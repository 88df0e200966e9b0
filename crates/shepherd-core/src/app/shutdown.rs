//! Graceful shutdown.
//!
//! 1 回目のシグナル: 現在のサイクルを終えてから drain に入る。
//! 2 回目のシグナル: drain の待ちを打ち切る（残ったプロセスは OS に任せる）。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::domain::{Result, WorkerError};

/// Sending half; every `request` bumps the signal count.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<u32>>,
}

impl ShutdownTrigger {
    pub fn request(&self) {
        self.tx.send_modify(|count| *count += 1);
    }
}

#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<u32>,
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        shutdown_channel().1
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow() >= 1
    }

    pub fn is_forced(&self) -> bool {
        *self.rx.borrow() >= 2
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&mut self) {
        // a dropped sender can never request anything; treat that as "never"
        if self.rx.wait_for(|count| *count >= 1).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(0);
    (ShutdownTrigger { tx: Arc::new(tx) }, ShutdownSignal { rx })
}

/// Spawns one listener task per configured signal name (`SIGTERM`, `SIGINT`, ...).
#[cfg(unix)]
pub fn install_signal_handlers(
    names: &[String],
    trigger: ShutdownTrigger,
) -> Result<Vec<JoinHandle<()>>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut handles = Vec::with_capacity(names.len());
    for name in names {
        let kind = match name.to_ascii_uppercase().as_str() {
            "SIGINT" => SignalKind::interrupt(),
            "SIGTERM" => SignalKind::terminate(),
            "SIGQUIT" => SignalKind::quit(),
            "SIGHUP" => SignalKind::hangup(),
            "SIGUSR1" => SignalKind::user_defined1(),
            "SIGUSR2" => SignalKind::user_defined2(),
            _ => return Err(WorkerError::UnknownSignal(name.clone())),
        };
        let mut stream =
            signal(kind).map_err(|err| WorkerError::UnknownSignal(format!("{name}: {err}")))?;
        let trigger = trigger.clone();
        let name = name.clone();
        handles.push(tokio::spawn(async move {
            while stream.recv().await.is_some() {
                info!(signal = %name, "shutdown signal received");
                trigger.request();
            }
        }));
    }
    Ok(handles)
}

#[cfg(not(unix))]
pub fn install_signal_handlers(
    names: &[String],
    trigger: ShutdownTrigger,
) -> Result<Vec<JoinHandle<()>>> {
    if let Some(name) = names.iter().find(|name| !name.eq_ignore_ascii_case("SIGINT")) {
        return Err(WorkerError::UnknownSignal(name.clone()));
    }
    if names.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!(signal = "SIGINT", "shutdown signal received");
            trigger.request();
        }
    })])
}
