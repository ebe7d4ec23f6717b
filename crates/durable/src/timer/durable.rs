//! Durable sleep

use std::time::Duration;

use tracing::{debug, info};

use crate::context::InvocationContext;
use crate::journal::EntryPayload;
use crate::workflow::DurableError;

use super::SchedulerError;

impl From<SchedulerError> for DurableError {
    fn from(err: SchedulerError) -> Self {
        Self::Infrastructure(err.to_string())
    }
}

impl InvocationContext {
    /// Sleep durably for `duration`
    ///
    /// The first execution journals the due time and suspends. Replays reuse
    /// the journaled due time, so restarts never shorten or extend the delay
    /// and never arm a second timer. Once due, the timer fires exactly once.
    ///
    /// Returns [`DurableError::Suspended`] while the timer is pending; workflow
    /// code should propagate it with `?`.
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), DurableError> {
        let name = format!("sleep-{}", self.timer_count);
        self.timer_count += 1;

        let fire_at = match self.peek_command().map(|entry| (&entry.name, &entry.payload)) {
            Some((entry_name, EntryPayload::TimerArmed { fire_at, .. })) if *entry_name == name => {
                let fire_at = *fire_at;
                self.consume_command();
                fire_at
            }
            Some(_) => return Err(self.divergence(&format!("timer '{name}'"))),
            None => {
                self.ensure_not_cancelled()?;
                let out_of_range =
                    || DurableError::workflow(format!("sleep duration {duration:?} is out of range"));
                let delay = chrono::Duration::from_std(duration).map_err(|_| out_of_range())?;
                let fire_at = self
                    .services()
                    .clock
                    .now()
                    .checked_add_signed(delay)
                    .ok_or_else(out_of_range)?;
                self.append(
                    &name,
                    EntryPayload::TimerArmed {
                        fire_at,
                        duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                    },
                )
                .await?;
                info!(invocation_id = %self.invocation_id(), timer = %name, %fire_at, "armed timer");
                fire_at
            }
        };

        match self.peek_command().map(|entry| (&entry.name, &entry.payload)) {
            Some((entry_name, EntryPayload::TimerFired { .. })) if *entry_name == name => {
                self.consume_command();
                return Ok(());
            }
            Some(_) => return Err(self.divergence(&format!("firing of timer '{name}'"))),
            None => {}
        }

        if self.services().clock.now() < fire_at {
            // Re-registering an already armed timer replaces its wake-up
            self.services()
                .scheduler
                .register_wakeup(self.invocation_id(), fire_at)
                .await?;
            debug!(invocation_id = %self.invocation_id(), timer = %name, %fire_at, "suspending");
            return Err(DurableError::Suspended { fire_at });
        }

        self.ensure_not_cancelled()?;
        self.append(&name, EntryPayload::TimerFired { fire_at }).await?;
        debug!(invocation_id = %self.invocation_id(), timer = %name, "timer fired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::context::ContextServices;
    use crate::journal::{EntryKind, InMemoryJournalStore, JournalStore, ReplayLog};
    use crate::timer::{Clock, InMemoryWakeups, ManualClock};

    struct Harness {
        store: Arc<InMemoryJournalStore>,
        clock: ManualClock,
        wakeups: Arc<InMemoryWakeups>,
        id: Uuid,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryJournalStore::new()),
                clock: ManualClock::starting_now(),
                wakeups: Arc::new(InMemoryWakeups::new()),
                id: Uuid::now_v7(),
            }
        }

        async fn context(&self) -> InvocationContext {
            let entries = self.store.read_all(self.id).await.unwrap();
            InvocationContext::new(
                self.id,
                "test",
                ReplayLog::from_entries(&entries),
                ContextServices {
                    store: self.store.clone(),
                    clock: Arc::new(self.clock.clone()),
                    scheduler: self.wakeups.clone(),
                },
                CancellationToken::new(),
            )
        }

        async fn kinds(&self) -> Vec<EntryKind> {
            let entries = self.store.read_all(self.id).await.unwrap();
            entries.iter().map(|e| e.kind()).collect()
        }
    }

    #[tokio::test]
    async fn test_sleep_suspends_then_fires_once() {
        let h = Harness::new();
        let start = h.clock.now();

        let mut ctx = h.context().await;
        let err = ctx.sleep(Duration::from_secs(1)).await.unwrap_err();
        let DurableError::Suspended { fire_at } = err else {
            panic!("expected suspension, got {err:?}");
        };
        assert_eq!(fire_at - start, chrono::Duration::seconds(1));
        assert_eq!(h.wakeups.pending(h.id), Some(fire_at));

        // Early resume re-suspends without arming another timer
        h.clock.advance(Duration::from_millis(500));
        let mut early = h.context().await;
        assert!(matches!(
            early.sleep(Duration::from_secs(1)).await,
            Err(DurableError::Suspended { fire_at: at }) if at == fire_at
        ));
        assert_eq!(h.kinds().await, vec![EntryKind::TimerArmed]);

        h.clock.advance(Duration::from_millis(500));
        let mut due = h.context().await;
        due.sleep(Duration::from_secs(1)).await.unwrap();

        let mut replay = h.context().await;
        replay.sleep(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            h.kinds().await,
            vec![EntryKind::TimerArmed, EntryKind::TimerFired]
        );
    }

    #[tokio::test]
    async fn test_changed_duration_keeps_journaled_due_time() {
        let h = Harness::new();

        let mut ctx = h.context().await;
        let Err(DurableError::Suspended { fire_at }) = ctx.sleep(Duration::from_secs(10)).await
        else {
            panic!("expected suspension");
        };

        let mut replay = h.context().await;
        let Err(DurableError::Suspended { fire_at: replayed }) =
            replay.sleep(Duration::from_secs(1)).await
        else {
            panic!("expected suspension");
        };
        assert_eq!(replayed, fire_at);
    }

    #[tokio::test]
    async fn test_sleep_past_the_calendar_is_rejected() {
        let h = Harness::new();
        let mut ctx = h.context().await;

        // Representable as a chrono duration, but not as a due time
        let far = Duration::from_secs(300_000 * 365 * 24 * 60 * 60);
        let err = ctx.sleep(far).await.unwrap_err();
        assert!(
            matches!(err, DurableError::Workflow(ref e) if e.message.contains("out of range")),
            "got {err:?}"
        );

        let err = ctx.sleep(Duration::MAX).await.unwrap_err();
        assert!(matches!(err, DurableError::Workflow(_)), "got {err:?}");
        assert!(h.kinds().await.is_empty());
    }

    #[tokio::test]
    async fn test_armed_duration_is_journaled_in_millis() {
        let h = Harness::new();
        let mut ctx = h.context().await;
        let _ = ctx.sleep(Duration::from_millis(1500)).await;

        let entries = h.store.read_all(h.id).await.unwrap();
        assert!(matches!(
            entries[0].payload,
            EntryPayload::TimerArmed {
                duration_ms: 1500,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_zero_sleep_fires_immediately() {
        let h = Harness::new();
        let mut ctx = h.context().await;
        ctx.sleep(Duration::ZERO).await.unwrap();
        assert_eq!(
            h.kinds().await,
            vec![EntryKind::TimerArmed, EntryKind::TimerFired]
        );
    }
}
