use crate::dispatch::CycleRunner;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Floor for the tick period. The send interval lives in the bot
/// configuration; ticking faster than this only burns queries.
pub const MIN_TICK_SECS: u64 = 5;

struct TickLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Start/stop lifecycle around the dispatch loop. Idle until `start`;
/// never persisted, so a process restart always begins Idle regardless of
/// the stored active flag.
#[derive(Default)]
pub struct Scheduler {
    task: Mutex<Option<TickLoop>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin ticking. Idempotent: a second `start` while running is a
    /// logged no-op, so there is never more than one trigger armed.
    ///
    /// Cycles run inline in the tick loop and missed ticks are skipped,
    /// which guarantees cycles never overlap: a slow cycle delays the
    /// next one instead of racing it.
    pub fn start(&self, runner: Arc<CycleRunner>, tick: Duration) {
        let mut guard = self.task.lock();
        if guard.is_some() {
            info!("scheduler already running");
            return;
        }

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = loop_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match runner.run_one_cycle(Utc::now()).await {
                            Ok(report) => {
                                if report.dispatched > 0 || report.failed > 0 {
                                    info!(
                                        dispatched = report.dispatched,
                                        skipped = report.skipped,
                                        failed = report.failed,
                                        "dispatch cycle finished"
                                    );
                                } else {
                                    debug!(skipped = report.skipped, "dispatch cycle idle");
                                }
                            }
                            Err(e) => warn!("dispatch cycle failed: {e:#}"),
                        }
                    }
                }
            }
            debug!("tick loop exited");
        });

        *guard = Some(TickLoop { cancel, handle });
        info!("scheduler started (tick every {}s)", tick.as_secs());
    }

    /// Stop ticking. Idempotent. Only future cycles are prevented; an
    /// in-flight cycle finishes on its own, detached, so `stop` stays
    /// responsive even while a send is mid-flight.
    pub fn stop(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        task.cancel.cancel();
        drop(task.handle);
        info!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BotConfigSpec, CollectionSpec, ConfigStore, DestinationSpec, SendMode};
    use crate::telegram::{ChatInfo, Transport};
    use anyhow::Result;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Transport that records sends and always fails, keeping the
    /// destination due so every tick produces exactly one send attempt.
    struct FailingTransport {
        sends: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for FailingTransport {
        async fn send(&self, _token: &str, chat_id: &str, _text: &str) -> Result<()> {
            self.sends.lock().push(chat_id.to_string());
            anyhow::bail!("wire down")
        }

        async fn test_connection(&self, _token: &str) -> bool {
            false
        }

        async fn list_chats(&self, _token: &str) -> Result<Vec<ChatInfo>> {
            Ok(vec![])
        }
    }

    fn seeded_runner(tmp: &TempDir) -> (Arc<CycleRunner>, Arc<FailingTransport>) {
        let store = Arc::new(ConfigStore::new(tmp.path().join("groupcast.db")));
        store
            .replace_config(&BotConfigSpec {
                token: "t".into(),
                interval_minutes: 1,
                send_mode: SendMode::Sequential,
                destinations: vec![DestinationSpec {
                    chat_id: "-1".into(),
                    name: "g".into(),
                }],
                collections: vec![CollectionSpec {
                    name: "c".into(),
                    sort_order: None,
                    messages: vec!["m".into()],
                }],
            })
            .unwrap();
        store.set_active(true).unwrap();

        let transport = Arc::new(FailingTransport {
            sends: Mutex::new(Vec::new()),
        });
        let runner = Arc::new(CycleRunner::new(
            store,
            transport.clone(),
            Duration::ZERO,
        ));
        (runner, transport)
    }

    #[tokio::test]
    async fn starts_idle_and_reports_state_transitions() {
        let tmp = TempDir::new().unwrap();
        let (runner, _transport) = seeded_runner(&tmp);
        let scheduler = Scheduler::new();

        assert!(!scheduler.is_running());
        scheduler.start(runner, Duration::from_secs(60));
        assert!(scheduler.is_running());
        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn double_start_leaves_one_trigger() {
        let tmp = TempDir::new().unwrap();
        let (runner, transport) = seeded_runner(&tmp);
        let scheduler = Scheduler::new();

        // Each trigger fires its first tick immediately; a duplicate
        // trigger would double the send count.
        scheduler.start(runner.clone(), Duration::from_secs(60));
        scheduler.start(runner, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(scheduler.is_running());
        assert_eq!(transport.sends.lock().len(), 1);

        // A single stop tears down the single trigger.
        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn double_stop_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let (runner, _transport) = seeded_runner(&tmp);
        let scheduler = Scheduler::new();

        scheduler.stop();
        scheduler.start(runner, Duration::from_secs(60));
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn stop_prevents_future_cycles() {
        let tmp = TempDir::new().unwrap();
        let (runner, transport) = seeded_runner(&tmp);
        let scheduler = Scheduler::new();

        scheduler.start(runner, Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.stop();

        // Let any cycle that was mid-flight at stop time drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_stop = transport.sends.lock().len();
        assert!(after_stop >= 1, "expected at least the immediate first cycle");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            transport.sends.lock().len(),
            after_stop,
            "no cycles may run after stop"
        );
    }

    #[tokio::test]
    async fn independent_schedulers_do_not_interfere() {
        let tmp_a = TempDir::new().unwrap();
        let tmp_b = TempDir::new().unwrap();
        let (runner_a, _) = seeded_runner(&tmp_a);
        let (runner_b, _) = seeded_runner(&tmp_b);

        let a = Scheduler::new();
        let b = Scheduler::new();
        a.start(runner_a, Duration::from_secs(60));
        b.start(runner_b, Duration::from_secs(60));

        a.stop();
        assert!(!a.is_running());
        assert!(b.is_running());
        b.stop();
    }
}
