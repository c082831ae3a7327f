//! Periodic heartbeat while a session is logged on.
//!
//! The scheduler owns a background task that pushes a `ClientHeartBeat`
//! envelope into the client's outbound queue on every tick. The client
//! encrypts and writes it like any other message.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::emsg::MsgType;
use crate::core::envelope::Envelope;
use crate::core::proto::HeartBeat;

/// Build the keepalive message sent on every tick.
pub fn heartbeat_message() -> Envelope {
    Envelope::proto(MsgType::CLIENT_HEARTBEAT, &HeartBeat::default())
}

#[derive(Debug, Default)]
pub struct HeartbeatScheduler {
    running: Option<Running>,
}

#[derive(Debug)]
struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    interval: Duration,
}

impl HeartbeatScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.running.is_some()
    }

    pub fn interval(&self) -> Option<Duration> {
        self.running.as_ref().map(|r| r.interval)
    }

    /// Start ticking every `interval`, replacing any running schedule. The
    /// first heartbeat goes out one full interval after the call.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, interval: Duration, sink: mpsc::Sender<Envelope>) {
        self.stop();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!("heartbeat tick");
                        tokio::select! {
                            _ = token.cancelled() => break,
                            sent = sink.send(heartbeat_message()) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        info!(interval_ms = interval.as_millis() as u64, "heartbeat started");
        self.running = Some(Running {
            cancel,
            task,
            interval,
        });
    }

    /// Stop the schedule. Idempotent; a tick already in flight is abandoned.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            running.task.abort();
            info!("heartbeat stopped");
        }
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_interval() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut scheduler = HeartbeatScheduler::new();
        scheduler.start(Duration::from_secs(30), tx);
        assert!(scheduler.is_active());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let beat = rx.recv().await.unwrap();
        assert_eq!(beat.msg_type(), MsgType::CLIENT_HEARTBEAT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_silences() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut scheduler = HeartbeatScheduler::new();
        scheduler.start(Duration::from_secs(1), tx);
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_active());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_interval() {
        let (tx, _rx) = mpsc::channel(8);
        let mut scheduler = HeartbeatScheduler::new();
        scheduler.start(Duration::from_secs(9), tx.clone());
        scheduler.start(Duration::from_secs(30), tx);
        assert_eq!(scheduler.interval(), Some(Duration::from_secs(30)));
    }
}
