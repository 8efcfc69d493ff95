use crate::store::{ConfigStore, MessageCollection, SendMode};
use crate::telegram::Transport;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Whether a destination has waited out its send interval.
///
/// A destination that has never been sent to is due immediately. The
/// boundary is inclusive: exactly `interval_minutes` elapsed counts as due.
pub fn is_due(
    last_sent_at: Option<DateTime<Utc>>,
    interval_minutes: i64,
    now: DateTime<Utc>,
) -> bool {
    match last_sent_at {
        None => true,
        Some(last) => now.signed_duration_since(last) >= ChronoDuration::minutes(interval_minutes),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    /// Every collection is empty (or there are none). A normal skip
    /// condition, not a failure.
    #[error("no message collection has any content")]
    NoContentAvailable,
}

/// Sequential-mode rotation cursor. Process state only — replaced
/// configurations reset it, nothing is persisted.
#[derive(Debug, Clone, Default)]
pub struct RotationState {
    pub config_id: String,
    pub next_index: usize,
}

/// Pick the next collection to send. Collections with no messages are
/// never eligible. Sequential mode walks the eligible set in sort order,
/// advancing one position per selection and wrapping; random mode draws
/// uniformly and independently every time it is called, so each
/// destination in a cycle gets its own draw.
pub fn select_collection<'a>(
    collections: &'a [MessageCollection],
    mode: SendMode,
    rotation: &mut RotationState,
) -> Result<&'a MessageCollection, SelectionError> {
    let eligible: Vec<&MessageCollection> = collections
        .iter()
        .filter(|c| !c.messages.is_empty())
        .collect();

    if eligible.is_empty() {
        return Err(SelectionError::NoContentAvailable);
    }

    let index = match mode {
        SendMode::Random => {
            use rand::Rng;
            rand::thread_rng().gen_range(0..eligible.len())
        }
        SendMode::Sequential => {
            let index = rotation.next_index % eligible.len();
            rotation.next_index = index + 1;
            index
        }
    };

    Ok(eligible[index])
}

/// Outcome counts for one dispatch cycle, for logs, status output and
/// tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Destinations whose whole collection went out and got a new
    /// last-sent timestamp.
    pub dispatched: usize,
    /// Destinations skipped because they were not due or had no eligible
    /// content.
    pub skipped: usize,
    /// Destinations where at least one message failed; their timestamp is
    /// left untouched so the collection is resent next due cycle.
    pub failed: usize,
}

/// Runs one evaluate-everything-and-send pass over the active
/// configuration.
pub struct CycleRunner {
    store: Arc<ConfigStore>,
    transport: Arc<dyn Transport>,
    inter_message_delay: Duration,
    rotation: Mutex<RotationState>,
}

impl CycleRunner {
    pub fn new(
        store: Arc<ConfigStore>,
        transport: Arc<dyn Transport>,
        inter_message_delay: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            inter_message_delay,
            rotation: Mutex::new(RotationState::default()),
        }
    }

    /// One dispatch cycle at `now`.
    ///
    /// Absent or inactive configuration is a logged no-op. Transport
    /// failures are contained per destination; a store error aborts the
    /// remainder of the cycle and the next tick retries from scratch.
    pub async fn run_one_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let Some(config) = self.store.active_config()? else {
            debug!("no active configuration; nothing to dispatch");
            return Ok(report);
        };

        if config.collections.iter().all(|c| c.messages.is_empty()) {
            debug!("no message collection has content; nothing to dispatch");
            return Ok(report);
        }

        for dest in &config.destinations {
            if !is_due(dest.last_sent_at, config.interval_minutes, now) {
                report.skipped += 1;
                continue;
            }

            let selected = {
                let mut rotation = self.rotation.lock();
                if rotation.config_id != config.id {
                    *rotation = RotationState {
                        config_id: config.id.clone(),
                        next_index: 0,
                    };
                }
                select_collection(&config.collections, config.send_mode, &mut rotation)
            };

            let collection = match selected {
                Ok(c) => c,
                Err(SelectionError::NoContentAvailable) => {
                    debug!(chat_id = %dest.chat_id, "no eligible collection; skipping destination");
                    report.skipped += 1;
                    continue;
                }
            };

            info!(
                collection = %collection.name,
                destination = %dest.name,
                chat_id = %dest.chat_id,
                "dispatching collection"
            );

            let mut all_sent = true;
            for (index, message) in collection.messages.iter().enumerate() {
                if index > 0 && !self.inter_message_delay.is_zero() {
                    tokio::time::sleep(self.inter_message_delay).await;
                }

                if let Err(e) = self
                    .transport
                    .send(&config.token, &dest.chat_id, &message.content)
                    .await
                {
                    warn!(
                        chat_id = %dest.chat_id,
                        position = message.position,
                        "send failed: {e:#}"
                    );
                    all_sent = false;
                }
            }

            if all_sent {
                self.store.update_last_sent(&dest.chat_id, now)?;
                report.dispatched += 1;
            } else {
                // No per-message resume state: the untouched timestamp
                // makes the whole collection go out again next due cycle.
                report.failed += 1;
            }
        }

        Ok(report)
    }
}
