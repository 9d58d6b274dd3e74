//! Hierarchical Timing Wheel (C5, §4.4). Five levels covering second,
//! minute, hour, day, and year granularities. The wheel holds no engine
//! logic of its own — it persists and schedules [`crate::model::Timer`]
//! records and calls back into a [`TimerSink`] when one fires.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::TimerError;
use crate::model::{CycleSpec, Timer, TimerKind, TimerState};
use crate::store::{StoreTransaction, TokenStore};

const SLOT_COUNTS: [u32; 5] = [60, 60, 24, 365, 100];
const SECONDS_PER_SLOT: [i64; 5] = [1, 60, 3_600, 86_400, 86_400 * 365];

/// Called when a timer's `fire_at` has elapsed. The wheel itself never
/// touches process instances or tokens — that's the execution engine's job.
#[async_trait]
pub trait TimerSink: Send + Sync {
    async fn on_timer_fired(&self, timer: Timer);
}

/// The wheel's own recurring housekeeping (§4.5 "Buffered-message expiry
/// sweep"). Not a user-visible timer, not persisted, not counted against
/// any namespace.
#[async_trait]
pub trait MessageSweeper: Send + Sync {
    async fn sweep_expired(&self, now: DateTime<Utc>);
}

struct Level {
    slots: Vec<VecDeque<(Uuid, DateTime<Utc>)>>,
    cursor: usize,
    seconds_per_slot: i64,
}

impl Level {
    fn new(slot_count: u32, seconds_per_slot: i64) -> Self {
        Self {
            slots: (0..slot_count).map(|_| VecDeque::new()).collect(),
            cursor: 0,
            seconds_per_slot,
        }
    }
}

pub struct TimingWheel {
    store: Arc<dyn TokenStore>,
    sink: Arc<dyn TimerSink>,
    sweeper: Option<Arc<dyn MessageSweeper>>,
    sweep_interval_ticks: u64,
    levels: parking_lot::Mutex<Vec<Level>>,
    tick_count: AtomicU64,
}

impl TimingWheel {
    pub fn new(store: Arc<dyn TokenStore>, sink: Arc<dyn TimerSink>) -> Self {
        Self::with_sweeper(store, sink, None, 30)
    }

    pub fn with_sweeper(
        store: Arc<dyn TokenStore>,
        sink: Arc<dyn TimerSink>,
        sweeper: Option<Arc<dyn MessageSweeper>>,
        sweep_interval_ticks: u64,
    ) -> Self {
        let levels = SLOT_COUNTS
            .iter()
            .zip(SECONDS_PER_SLOT.iter())
            .map(|(count, secs)| Level::new(*count, *secs))
            .collect();
        Self {
            store,
            sink,
            sweeper,
            sweep_interval_ticks,
            levels: parking_lot::Mutex::new(levels),
            tick_count: AtomicU64::new(0),
        }
    }

    /// Schedule algorithm (§4.4 step 1-3): persist, then place in the
    /// lowest level whose span covers the delta to `fire_at`.
    pub async fn schedule(&self, mut timer: Timer) -> Result<(), TimerError> {
        let (level, slot) = self.place(timer.fire_at);
        timer.wheel_level = level as u8;
        timer.wheel_slot = slot as u32;
        self.store
            .commit(StoreTransaction::new().put_timer(timer.clone()))
            .await?;
        self.levels.lock()[level].slots[slot].push_back((timer.timer_id, timer.fire_at));
        Ok(())
    }

    /// Cancellation is idempotent and lazy: the in-memory slot entry is left
    /// in place and skipped at fire time once the store reports it cancelled.
    pub async fn cancel(&self, timer_id: Uuid) -> Result<(), TimerError> {
        let timer = match self.store.load_timer(timer_id).await? {
            Some(t) => t,
            None => return Ok(()),
        };
        if timer.state != TimerState::Scheduled {
            return Ok(());
        }
        let mut cancelled = timer;
        cancelled.state = TimerState::Cancelled;
        self.store
            .commit(StoreTransaction::new().put_timer(cancelled))
            .await?;
        Ok(())
    }

    /// Recovery (§4.4): reload every `SCHEDULED` timer and re-insert it at
    /// its original `fire_at`. Past-due timers land in slot 0.
    pub async fn recover(&self) -> Result<(), TimerError> {
        let scheduled = self.store.list_scheduled_timers().await?;
        let now = Utc::now();
        let mut levels = self.levels.lock();
        for timer in scheduled {
            let delta = (timer.fire_at - now).num_seconds().max(1);
            let (level, slot) = Self::locate(&levels[..], delta);
            levels[level].slots[slot].push_back((timer.timer_id, timer.fire_at));
        }
        Ok(())
    }

    /// Advance the clock by one second. Fired timer ids are dispatched to a
    /// background task each so a slow callback never stalls the next tick.
    pub async fn tick(self: &Arc<Self>) {
        let due = self.advance();
        for timer_id in due {
            let wheel = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = wheel.fire_one(timer_id).await {
                    tracing::warn!(%timer_id, error = %err, "timer callback failed");
                }
            });
        }

        let n = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(sweeper) = self.sweeper.clone() {
            if n % self.sweep_interval_ticks == 0 {
                tokio::spawn(async move { sweeper.sweep_expired(Utc::now()).await });
            }
        }
    }

    /// Run the clock forever, ticking once a second. Intended to be spawned
    /// as its own task; ticks are single-threaded by construction.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// `delta` is floored at 1 second: a timer due now or in the past still
    /// waits for the next tick rather than being placed in the slot the
    /// cursor just drained (§4.4 step 1, "fires at next tick").
    fn place(&self, fire_at: DateTime<Utc>) -> (usize, usize) {
        let delta = (fire_at - Utc::now()).num_seconds().max(1);
        let levels = self.levels.lock();
        Self::locate(&levels[..], delta)
    }

    fn locate(levels: &[Level], delta: i64) -> (usize, usize) {
        for (k, level) in levels.iter().enumerate() {
            let capacity = level.seconds_per_slot * SLOT_COUNTS[k] as i64;
            if delta < capacity || k == levels.len() - 1 {
                let offset_slots = (delta / level.seconds_per_slot) as usize;
                let slot = (level.cursor + offset_slots) % SLOT_COUNTS[k] as usize;
                return (k, slot);
            }
        }
        unreachable!("last level always matches")
    }

    /// Advance cursor[0], draining its slot. Cascades higher levels back
    /// into lower ones as their cursors wrap (§4.4 "Tick algorithm").
    fn advance(&self) -> Vec<Uuid> {
        let mut levels = self.levels.lock();
        let now = Utc::now();

        levels[0].cursor = (levels[0].cursor + 1) % SLOT_COUNTS[0] as usize;
        let c0 = levels[0].cursor;
        let due: Vec<(Uuid, DateTime<Utc>)> = levels[0].slots[c0].drain(..).collect();

        let mut wrapped = c0 == 0;
        let mut level_idx = 1;
        while wrapped && level_idx < levels.len() {
            levels[level_idx].cursor = (levels[level_idx].cursor + 1) % SLOT_COUNTS[level_idx] as usize;
            let slot_idx = levels[level_idx].cursor;
            let to_requeue: Vec<(Uuid, DateTime<Utc>)> = levels[level_idx].slots[slot_idx].drain(..).collect();
            wrapped = slot_idx == 0;

            for (id, fire_at) in to_requeue {
                let delta = (fire_at - now).num_seconds().max(1);
                let (target_level, target_slot) = Self::locate(&levels[..], delta);
                levels[target_level].slots[target_slot].push_back((id, fire_at));
            }
            level_idx += 1;
        }

        due.into_iter().map(|(id, _)| id).collect()
    }

    async fn fire_one(self: &Arc<Self>, timer_id: Uuid) -> Result<(), TimerError> {
        let timer = match self.store.load_timer(timer_id).await? {
            Some(t) if t.state == TimerState::Scheduled => t,
            _ => return Ok(()),
        };

        let mut fired = timer.clone();
        fired.state = TimerState::Fired;
        let mut tx = StoreTransaction::new().put_timer(fired).append_event(
            timer.instance_id.unwrap_or(Uuid::nil()),
            crate::model::RuntimeEvent::TimerFired { timer_id },
        );

        let mut reinsert = None;
        if let (TimerKind::Cycle, Some(cycle)) = (&timer.kind, &timer.cycle) {
            if cycle.remaining_iterations.map(|n| n > 1).unwrap_or(true) {
                let mut next = timer.clone();
                next.timer_id = Uuid::now_v7();
                next.fire_at = Utc::now() + Duration::seconds(cycle.interval_seconds.max(1));
                next.state = TimerState::Scheduled;
                next.cycle = Some(CycleSpec {
                    interval_seconds: cycle.interval_seconds,
                    remaining_iterations: cycle.remaining_iterations.map(|n| n - 1),
                });
                let (level, slot) = self.place(next.fire_at);
                next.wheel_level = level as u8;
                next.wheel_slot = slot as u32;
                tx = tx.put_timer(next.clone());
                reinsert = Some((next.timer_id, next.fire_at, level, slot));
            }
        }

        self.store.commit(tx).await?;

        if let Some((id, fire_at, level, slot)) = reinsert {
            self.levels.lock()[level].slots[slot].push_back((id, fire_at));
        }

        self.sink.on_timer_fired(timer).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        fired: StdMutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl TimerSink for RecordingSink {
        async fn on_timer_fired(&self, timer: Timer) {
            self.fired.lock().unwrap().push(timer.timer_id);
        }
    }

    fn sample_timer(fire_at: DateTime<Utc>) -> Timer {
        Timer {
            timer_id: Uuid::now_v7(),
            kind: TimerKind::Duration,
            fire_at,
            cycle: None,
            element_id: Some("timer1".into()),
            token_id: None,
            instance_id: None,
            state: TimerState::Scheduled,
            wheel_level: 0,
            wheel_slot: 0,
            user_namespace: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn schedule_persists_and_places_in_level_zero_for_near_term_timers() {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink { fired: StdMutex::new(Vec::new()) });
        let wheel = Arc::new(TimingWheel::new(store.clone(), sink));

        let timer = sample_timer(Utc::now() + Duration::seconds(3));
        let timer_id = timer.timer_id;
        wheel.schedule(timer).await.unwrap();

        let loaded = store.load_timer(timer_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, TimerState::Scheduled);
        assert_eq!(loaded.wheel_level, 0);
    }

    #[tokio::test]
    async fn tick_fires_due_timers() {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink { fired: StdMutex::new(Vec::new()) });
        let wheel = Arc::new(TimingWheel::new(store.clone(), sink.clone()));

        let timer = sample_timer(Utc::now() + Duration::seconds(1));
        let timer_id = timer.timer_id;
        wheel.schedule(timer).await.unwrap();

        wheel.tick().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let loaded = store.load_timer(timer_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, TimerState::Fired);
        assert_eq!(sink.fired.lock().unwrap().as_slice(), &[timer_id]);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_prevents_firing() {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink { fired: StdMutex::new(Vec::new()) });
        let wheel = Arc::new(TimingWheel::new(store.clone(), sink.clone()));

        let timer = sample_timer(Utc::now() + Duration::seconds(1));
        let timer_id = timer.timer_id;
        wheel.schedule(timer).await.unwrap();

        wheel.cancel(timer_id).await.unwrap();
        wheel.cancel(timer_id).await.unwrap();

        wheel.tick().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(sink.fired.lock().unwrap().is_empty());
        let loaded = store.load_timer(timer_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, TimerState::Cancelled);
    }

    #[tokio::test]
    async fn cycle_timer_reschedules_and_decrements_remaining_iterations() {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink { fired: StdMutex::new(Vec::new()) });
        let wheel = Arc::new(TimingWheel::new(store.clone(), sink.clone()));

        let mut timer = sample_timer(Utc::now() + Duration::seconds(1));
        timer.kind = TimerKind::Cycle;
        timer.cycle = Some(CycleSpec { interval_seconds: 60, remaining_iterations: Some(2) });
        let first_id = timer.timer_id;
        wheel.schedule(timer).await.unwrap();

        wheel.tick().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let first = store.load_timer(first_id).await.unwrap().unwrap();
        assert_eq!(first.state, TimerState::Fired);

        let scheduled = store.list_scheduled_timers().await.unwrap();
        assert_eq!(scheduled.len(), 1);
        let next = &scheduled[0];
        assert_eq!(next.cycle.as_ref().unwrap().remaining_iterations, Some(1));
        assert_ne!(next.timer_id, first_id);
    }

    #[tokio::test]
    async fn recover_reinserts_scheduled_timers_from_the_store() {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
        let timer = sample_timer(Utc::now() - Duration::seconds(5));
        store
            .commit(StoreTransaction::new().put_timer(timer.clone()))
            .await
            .unwrap();

        let sink = Arc::new(RecordingSink { fired: StdMutex::new(Vec::new()) });
        let wheel = Arc::new(TimingWheel::new(store.clone(), sink.clone()));
        wheel.recover().await.unwrap();

        wheel.tick().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(sink.fired.lock().unwrap().as_slice(), &[timer.timer_id]);
    }
}
