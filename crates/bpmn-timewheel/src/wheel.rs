use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use bpmn_incidents::{IncidentSink, NewIncident};
use bpmn_storage::{KvStore, StorageGateway};
use bpmn_types::{
    CycleMeta, IncidentType, InstanceId, TimerFiredCallback, TimerId, TimerKind, TimerRecord,
    TimerState, TokenId,
};

use crate::error::TimerError;
use crate::iso8601;

/// Slot counts for {seconds, minutes, hours, days, years} (§4.B Structure).
const SLOT_COUNTS: [i64; 5] = [60, 60, 24, 365, 100];
/// Seconds spanned by one slot at each level.
const UNIT_SECONDS: [i64; 5] = [1, 60, 3600, 86400, 31_536_000];

fn level_for_delay(delay_secs: i64) -> usize {
    if delay_secs < UNIT_SECONDS[1] {
        0
    } else if delay_secs < UNIT_SECONDS[2] {
        1
    } else if delay_secs < UNIT_SECONDS[3] {
        2
    } else if delay_secs < UNIT_SECONDS[4] {
        3
    } else {
        4
    }
}

fn slot_for(level: usize, due_secs: i64) -> usize {
    ((due_secs / UNIT_SECONDS[level]).rem_euclid(SLOT_COUNTS[level])) as usize
}

/// Request to schedule a new timer (§3.4, §4.B `Add`).
pub struct NewTimer {
    pub element_id: String,
    pub process_instance_id: InstanceId,
    pub token_id: TokenId,
    pub timer_type: TimerKind,
    pub expression: String,
}

struct TimerLocation {
    level: usize,
    slot: usize,
    due_secs: i64,
}

struct WheelState {
    slots: [Vec<HashSet<TimerId>>; 5],
    index: HashMap<TimerId, TimerLocation>,
    /// Last unit boundary (`now_secs / UNIT_SECONDS[level]`) already
    /// cascaded for levels 1..=4, so a racing tick and demotion pass never
    /// double-cascade the same slot.
    last_cascade: [i64; 5],
}

impl WheelState {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|level| (0..SLOT_COUNTS[level]).map(|_| HashSet::new()).collect()),
            index: HashMap::new(),
            last_cascade: [i64::MIN; 5],
        }
    }

    fn place(&mut self, timer_id: TimerId, due_secs: i64, now_secs: i64) {
        let delay = (due_secs - now_secs).max(0);
        let level = level_for_delay(delay);
        let slot = slot_for(level, due_secs);
        self.slots[level][slot].insert(timer_id.clone());
        self.index.insert(timer_id, TimerLocation { level, slot, due_secs });
    }

    fn remove(&mut self, timer_id: &TimerId) -> Option<TimerLocation> {
        let loc = self.index.remove(timer_id)?;
        self.slots[loc.level][loc.slot].remove(timer_id);
        Some(loc)
    }

    /// Move every timer sitting in the just-elapsed slot at `level` down to
    /// its correctly finer-grained slot, per the current boundary.
    fn cascade(&mut self, level: usize, now_secs: i64) {
        let elapsed_slot = slot_for(level, now_secs - 1);
        let ids: Vec<TimerId> = self.slots[level][elapsed_slot].drain().collect();
        for id in ids {
            if let Some(loc) = self.index.remove(&id) {
                self.place(id, loc.due_secs, now_secs);
            }
        }
    }
}

/// Inner shared state a `TimeWheel` handle and its ticker/demotion threads
/// all reach through a `Weak`/`Arc` pair — same shape as
/// `EngineConfig::build_engine`'s epoch thread.
struct TimeWheelInner<K: KvStore> {
    state: Mutex<WheelState>,
    gateway: StorageGateway<K>,
    incidents: Arc<dyn IncidentSink>,
    callbacks: SyncSender<TimerFiredCallback>,
}

impl<K: KvStore> TimeWheelInner<K> {
    fn fire_locked(&self, timer_id: &TimerId, now: DateTime<Utc>) -> Result<(), TimerError> {
        let Some(mut record) = self.gateway.get_timer(timer_id.as_str())? else {
            // Token canceled in the interim; the executor treats unknown
            // tokens as no-ops, so the firing is simply dropped (§4.B
            // Failure semantics).
            debug!(timer_id = %timer_id, "fired timer has no record, discarding");
            return Ok(());
        };

        record.state = TimerState::Fired;
        self.gateway.save_timer(&record)?;

        let callback = TimerFiredCallback {
            timer_id: record.timer_id.clone(),
            element_id: record.element_id.clone(),
            token_id: record.token_id.clone(),
            process_instance_id: record.process_instance_id.clone(),
            fired_at: now,
        };
        match self.callbacks.try_send(callback) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(timer_id = %timer_id, "outbound timer callback channel full, dropping");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(timer_id = %timer_id, "no consumer for timer callbacks");
            }
        }

        if let Some(cycle) = record.cycle.clone() {
            self.reschedule_cycle(&record, cycle, now)?;
        }
        Ok(())
    }

    fn reschedule_cycle(
        &self,
        fired: &TimerRecord,
        cycle: CycleMeta,
        now: DateTime<Utc>,
    ) -> Result<(), TimerError> {
        let repeats_remaining = match cycle.repeats_remaining {
            Some(0) => return Ok(()),
            Some(n) => Some(n - 1),
            None => None,
        };
        // Re-anchor on the planned next tick (fired.scheduled_at + interval),
        // not on `now` — Design Notes §9(a).
        let next_due = fired.scheduled_at + cycle.interval;

        let mut next = fired.clone();
        next.state = TimerState::Scheduled;
        next.scheduled_at = next_due;
        next.cycle = Some(CycleMeta {
            repeats_remaining,
            interval: cycle.interval,
        });
        self.gateway.save_timer(&next)?;

        let mut state = self.state.lock().expect("time wheel lock poisoned");
        state.place(next.timer_id, next_due.timestamp(), now.timestamp());
        Ok(())
    }

    fn tick_fire(&self, now: DateTime<Utc>) {
        let now_secs = now.timestamp();
        let slot = slot_for(0, now_secs);
        let due: Vec<TimerId> = {
            let mut state = self.state.lock().expect("time wheel lock poisoned");
            state.slots[0][slot].drain().collect()
        };
        for id in due {
            {
                let mut state = self.state.lock().expect("time wheel lock poisoned");
                state.index.remove(&id);
            }
            if let Err(err) = self.fire_locked(&id, now) {
                warn!(timer_id = %id, error = %err, "failed to fire timer");
            }
        }
    }

    fn tick_cascade(&self, now: DateTime<Utc>) {
        let now_secs = now.timestamp();
        let mut state = self.state.lock().expect("time wheel lock poisoned");
        for level in 1..5 {
            let boundary = now_secs / UNIT_SECONDS[level];
            if boundary != state.last_cascade[level] {
                state.cascade(level, now_secs);
                state.last_cascade[level] = boundary;
            }
        }
    }
}

/// Tick cadence and channel sizing knobs (§4.B, §5). Defaults match the
/// specification's stated defaults.
#[derive(Clone, Copy, Debug)]
pub struct TimeWheelConfig {
    pub tick_interval: StdDuration,
    pub callback_channel_capacity: usize,
}

impl Default for TimeWheelConfig {
    fn default() -> Self {
        Self {
            tick_interval: StdDuration::from_secs(1),
            callback_channel_capacity: 100,
        }
    }
}

impl TimeWheelConfig {
    pub fn tick_interval(mut self, interval: StdDuration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn build<K: KvStore + 'static>(
        &self,
        gateway: StorageGateway<K>,
        incidents: Arc<dyn IncidentSink>,
    ) -> (TimeWheel<K>, Receiver<TimerFiredCallback>) {
        let (sender, receiver) = sync_channel(self.callback_channel_capacity);
        let inner = Arc::new(TimeWheelInner {
            state: Mutex::new(WheelState::new()),
            gateway,
            incidents,
            callbacks: sender,
        });

        let fire_inner = Arc::downgrade(&inner);
        let tick_interval = self.tick_interval;
        thread::spawn(move || loop {
            thread::sleep(tick_interval);
            match fire_inner.upgrade() {
                Some(inner) => inner.tick_fire(Utc::now()),
                None => break,
            }
        });

        let cascade_inner = Arc::downgrade(&inner);
        thread::spawn(move || loop {
            thread::sleep(tick_interval);
            match cascade_inner.upgrade() {
                Some(inner) => inner.tick_cascade(Utc::now()),
                None => break,
            }
        });

        (TimeWheel { inner }, receiver)
    }
}

/// Handle to a running hierarchical time wheel (§4.B). Dropping the last
/// `TimeWheel` handle tears down its ticker and demotion threads: they
/// hold only `Weak` references and exit once `upgrade()` fails.
pub struct TimeWheel<K: KvStore> {
    inner: Arc<TimeWheelInner<K>>,
}

impl<K: KvStore> Clone for TimeWheel<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: KvStore + 'static> TimeWheel<K> {
    /// Validate, resolve the due time, persist, and place the timer
    /// (§4.B `Add`). Parse failure raises `TIMER_ERROR` and the timer is
    /// never scheduled.
    pub fn add(&self, new: NewTimer, now: DateTime<Utc>) -> Result<TimerRecord, TimerError> {
        let resolved = match new.timer_type {
            TimerKind::Duration => iso8601::parse_duration(&new.expression).map(|d| (now + d, None)),
            TimerKind::Date => iso8601::parse_date(&new.expression).map(|d| (d, None)),
            TimerKind::Cycle => iso8601::parse_cycle(&new.expression).map(|(repeats, interval)| {
                // `repeats` is the total fire count from `R<n>/...`; the
                // first fire happens here via the initial `place`, so only
                // `n - 1` further reschedules remain.
                let repeats_remaining = repeats.map(|n| n.saturating_sub(1));
                (now + interval, Some(CycleMeta { repeats_remaining, interval }))
            }),
        };

        let (scheduled_at, cycle) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                self.inner.incidents.raise(
                    NewIncident::new(IncidentType::TimerError, err.to_string())
                        .instance(new.process_instance_id)
                        .element(new.element_id)
                        .token(new.token_id),
                    now,
                )?;
                return Err(err);
            }
        };

        let record = TimerRecord {
            timer_id: TimerId::generate(),
            element_id: new.element_id,
            process_instance_id: new.process_instance_id,
            token_id: new.token_id,
            timer_type: new.timer_type,
            time_duration: matches!(new.timer_type, TimerKind::Duration).then(|| new.expression.clone()),
            time_date: matches!(new.timer_type, TimerKind::Date).then(|| new.expression.clone()),
            time_cycle: matches!(new.timer_type, TimerKind::Cycle).then(|| new.expression.clone()),
            state: TimerState::Scheduled,
            scheduled_at,
            created_at: now,
            cycle,
        };
        self.inner.gateway.save_timer(&record)?;

        let mut state = self.inner.state.lock().expect("time wheel lock poisoned");
        state.place(record.timer_id.clone(), scheduled_at.timestamp(), now.timestamp());
        Ok(record)
    }

    /// Mark a timer CANCELLED and remove it from its slot (§4.B `Cancel`).
    pub fn cancel(&self, timer_id: &str) -> Result<(), TimerError> {
        let mut record = self
            .inner
            .gateway
            .get_timer(timer_id)?
            .ok_or_else(|| TimerError::NotFound(timer_id.to_string()))?;
        record.state = TimerState::Cancelled;
        self.inner.gateway.save_timer(&record)?;

        let mut state = self.inner.state.lock().expect("time wheel lock poisoned");
        state.remove(&TimerId::from_raw(timer_id.to_string()));
        Ok(())
    }

    /// On startup, scan storage for `SCHEDULED` timers and re-place each;
    /// timers whose due time already passed fire immediately, at least
    /// once (§4.B `Restore`).
    pub fn restore(&self, now: DateTime<Utc>) -> Result<usize, TimerError> {
        let scheduled = self.inner.gateway.list_timers_by_state(TimerState::Scheduled)?;
        let count = scheduled.len();
        for record in scheduled {
            if record.scheduled_at <= now {
                self.inner.fire_locked(&record.timer_id, now)?;
            } else {
                let mut state = self.inner.state.lock().expect("time wheel lock poisoned");
                state.place(record.timer_id, record.scheduled_at.timestamp(), now.timestamp());
            }
        }
        Ok(count)
    }

    /// `(level, remaining_seconds)` for a scheduled timer, or `None` if
    /// unknown (§4.B `GetInfo`).
    pub fn get_info(&self, timer_id: &str, now: DateTime<Utc>) -> Option<(usize, i64)> {
        let state = self.inner.state.lock().expect("time wheel lock poisoned");
        let loc = state.index.get(&TimerId::from_raw(timer_id.to_string()))?;
        Some((loc.level, (loc.due_secs - now.timestamp()).max(0)))
    }
}
