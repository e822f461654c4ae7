//! C4: the per-room countdown timer service.
//!
//! The in-memory timer is authoritative; the repository snapshot exists only
//! to give a reconnecting client something to render before the next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use retrotro_wire::outbound::{
    OutboundEvent, TimerEndedPayload, TimerExtendedPayload, TimerPausedPayload,
    TimerResumedPayload, TimerStartedPayload, TimerTickPayload,
};
use retrotro_wire::RoomId;

use crate::bus::Bus;
use crate::error::EngineError;
use crate::repository::Repository;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
enum TimerPhase {
    Running { started_at: Instant, duration: Duration },
    Paused { remaining: Duration, duration: Duration },
}

struct TimerEntry {
    phase: TimerPhase,
    initial_duration: Duration,
    generation: u64,
}

fn remaining_seconds(entry: &TimerEntry, now: Instant) -> u64 {
    match entry.phase {
        TimerPhase::Running { started_at, duration } => {
            duration.saturating_sub(now.saturating_duration_since(started_at)).as_secs()
        }
        TimerPhase::Paused { remaining, .. } => remaining.as_secs(),
    }
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Drives every room's countdown on a 1-second cadence and persists enough
/// state through the repository for a reconnecting client to render a
/// timer before the next tick arrives.
pub struct TimerService {
    repository: Arc<dyn Repository>,
    bus: Arc<Bus>,
    tick_sparse_interval_s: u64,
    tick_dense_threshold_s: u64,
    timers: Arc<Mutex<HashMap<RoomId, TimerEntry>>>,
}

impl TimerService {
    pub fn new(
        repository: Arc<dyn Repository>,
        bus: Arc<Bus>,
        tick_sparse_interval_s: u64,
        tick_dense_threshold_s: u64,
    ) -> Self {
        Self {
            repository,
            bus,
            tick_sparse_interval_s,
            tick_dense_threshold_s,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts a fresh timer for `room`, stopping any existing one first.
    pub async fn start(&self, room: &RoomId, duration_seconds: u64) -> Result<(), EngineError> {
        self.stop(room).await?;

        let duration = Duration::from_secs(duration_seconds);
        let started_at = Instant::now();
        let generation = {
            let mut timers = self.timers.lock();
            let generation = next_generation(&timers, room);
            timers.insert(
                room.clone(),
                TimerEntry {
                    phase: TimerPhase::Running { started_at, duration },
                    initial_duration: duration,
                    generation,
                },
            );
            generation
        };

        self.persist_running(room, now_epoch_ms(), duration_seconds).await;

        let phase = self.repository.session_state(room).await?.current_phase;
        let end_at_ms = now_epoch_ms() + (duration_seconds as i64 * 1000);
        self.bus
            .broadcast_to_room(
                room,
                OutboundEvent::TimerStarted(TimerStartedPayload {
                    phase,
                    duration_seconds,
                    end_at_ms,
                }),
            )
            .await?;

        self.spawn_cadence(room.clone(), generation);
        Ok(())
    }

    /// Freezes the countdown at its current remaining time.
    pub async fn pause(&self, room: &RoomId) -> Result<(), EngineError> {
        let remaining = {
            let mut timers = self.timers.lock();
            let entry = timers
                .get_mut(room)
                .ok_or_else(|| EngineError::NotFound(format!("no timer running for {room}")))?;
            let TimerPhase::Running { started_at, duration } = entry.phase else {
                return Err(EngineError::NotFound(format!("timer for {room} is not running")));
            };
            let remaining = duration.saturating_sub(started_at.elapsed());
            entry.phase = TimerPhase::Paused { remaining, duration };
            // Bumping the generation stops the cadence task started by the
            // prior `Running` phase from emitting any further ticks.
            entry.generation += 1;
            remaining
        };

        let remaining_seconds = remaining.as_secs();
        self.repository
            .save_timer_state(room, None, None, Some(now_epoch_ms()), Some(remaining_seconds))
            .await
            .unwrap_or_else(|err| warn!(%err, %room, "failed to persist paused timer state"));

        self.bus
            .broadcast_to_room(
                room,
                OutboundEvent::TimerPaused(TimerPausedPayload { remaining_seconds }),
            )
            .await
    }

    /// Resumes a paused timer, restarting the cadence.
    pub async fn resume(&self, room: &RoomId) -> Result<(), EngineError> {
        let (remaining_seconds, generation) = {
            let mut timers = self.timers.lock();
            let entry = timers
                .get_mut(room)
                .ok_or_else(|| EngineError::NotFound(format!("no timer for {room}")))?;
            let TimerPhase::Paused { remaining, duration } = entry.phase else {
                return Err(EngineError::NotFound(format!("timer for {room} is not paused")));
            };
            let started_at = Instant::now() - duration.saturating_sub(remaining);
            entry.phase = TimerPhase::Running { started_at, duration };
            entry.generation += 1;
            (remaining.as_secs(), entry.generation)
        };

        self.persist_running(room, now_epoch_ms(), remaining_seconds).await;

        let end_at_ms = now_epoch_ms() + (remaining_seconds as i64 * 1000);
        self.bus
            .broadcast_to_room(
                room,
                OutboundEvent::TimerResumed(TimerResumedPayload { remaining_seconds, end_at_ms }),
            )
            .await?;

        self.spawn_cadence(room.clone(), generation);
        Ok(())
    }

    /// Extends the current duration by `added_seconds`, in either state.
    pub async fn add_time(&self, room: &RoomId, added_seconds: u64) -> Result<(), EngineError> {
        let new_remaining_seconds = {
            let mut timers = self.timers.lock();
            let entry = timers
                .get_mut(room)
                .ok_or_else(|| EngineError::NotFound(format!("no timer for {room}")))?;
            match &mut entry.phase {
                TimerPhase::Running { started_at, duration } => {
                    *duration += Duration::from_secs(added_seconds);
                    duration.saturating_sub(started_at.elapsed()).as_secs()
                }
                TimerPhase::Paused { remaining, duration } => {
                    *remaining += Duration::from_secs(added_seconds);
                    *duration += Duration::from_secs(added_seconds);
                    remaining.as_secs()
                }
            }
        };

        let new_end_at_ms = now_epoch_ms() + (new_remaining_seconds as i64 * 1000);
        self.bus
            .broadcast_to_room(
                room,
                OutboundEvent::TimerExtended(TimerExtendedPayload {
                    added_seconds,
                    new_remaining: new_remaining_seconds,
                    new_end_at_ms,
                }),
            )
            .await
    }

    /// Stops and restarts with the original duration.
    pub async fn reset(&self, room: &RoomId) -> Result<(), EngineError> {
        let initial_duration_seconds = {
            let timers = self.timers.lock();
            let entry = timers
                .get(room)
                .ok_or_else(|| EngineError::NotFound(format!("no timer for {room}")))?;
            entry.initial_duration.as_secs()
        };
        self.start(room, initial_duration_seconds).await
    }

    /// Returns `(running, remaining_seconds)` for `room`'s timer, if one is
    /// active. Used to populate the `timer` field of a `retro_state` snapshot.
    pub fn remaining(&self, room: &RoomId) -> Option<(bool, u64)> {
        let timers = self.timers.lock();
        let entry = timers.get(room)?;
        let running = matches!(entry.phase, TimerPhase::Running { .. });
        Some((running, remaining_seconds(entry, Instant::now())))
    }

    /// Stops the cadence and clears persisted timer fields; emits nothing.
    /// A no-op if no timer is running.
    pub async fn stop(&self, room: &RoomId) -> Result<(), EngineError> {
        let removed = self.timers.lock().remove(room).is_some();
        if !removed {
            return Ok(());
        }
        self.repository
            .clear_timer_state(room)
            .await
            .unwrap_or_else(|err| warn!(%err, %room, "failed to clear persisted timer state"));
        Ok(())
    }

    async fn persist_running(&self, room: &RoomId, started_at_ms: i64, duration_seconds: u64) {
        self.repository
            .save_timer_state(room, Some(started_at_ms), Some(duration_seconds), None, None)
            .await
            .unwrap_or_else(|err| warn!(%err, %room, "failed to persist running timer state"));
    }

    fn spawn_cadence(&self, room: RoomId, generation: u64) {
        let timers = Arc::clone(&self.timers);
        let repository = Arc::clone(&self.repository);
        let bus = Arc::clone(&self.bus);
        let tick_sparse_interval_s = self.tick_sparse_interval_s.max(1);
        let tick_dense_threshold_s = self.tick_dense_threshold_s;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let remaining = {
                    let timers = timers.lock();
                    match timers.get(&room) {
                        Some(entry) if entry.generation == generation => {
                            Some(remaining_seconds(entry, now))
                        }
                        // Superseded by a pause/resume/stop/reset; this task is done.
                        _ => None,
                    }
                };
                let Some(remaining) = remaining else { break };

                if remaining == 0 {
                    let phase = match repository.session_state(&room).await {
                        Ok(state) => state.current_phase,
                        Err(err) => {
                            warn!(%err, %room, "failed to read phase for timer_ended");
                            timers.lock().remove(&room);
                            break;
                        }
                    };
                    timers.lock().remove(&room);
                    repository
                        .clear_timer_state(&room)
                        .await
                        .unwrap_or_else(|err| warn!(%err, %room, "failed to clear ended timer state"));
                    if let Err(err) = bus
                        .broadcast_to_room(&room, OutboundEvent::TimerEnded(TimerEndedPayload { phase }))
                        .await
                    {
                        warn!(%err, %room, "failed to broadcast timer_ended");
                    }
                    break;
                }

                let emit = remaining % tick_sparse_interval_s == 0 || remaining <= tick_dense_threshold_s;
                if !emit {
                    continue;
                }
                let phase = match repository.session_state(&room).await {
                    Ok(state) => state.current_phase,
                    Err(err) => {
                        warn!(%err, %room, "failed to read phase for timer_tick");
                        continue;
                    }
                };
                if let Err(err) = bus
                    .broadcast_to_room(
                        &room,
                        OutboundEvent::TimerTick(TimerTickPayload { remaining_seconds: remaining, phase }),
                    )
                    .await
                {
                    warn!(%err, %room, "failed to broadcast timer_tick");
                }
            }
        });
    }
}

fn next_generation(timers: &HashMap<RoomId, TimerEntry>, room: &RoomId) -> u64 {
    timers.get(room).map(|entry| entry.generation + 1).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::transport::in_process::InProcessTransport;
    use crate::hub::Hub;
    use crate::repository::InMemoryRepository;
    use retrotro_wire::PodId;

    async fn service() -> (TimerService, RoomId) {
        let hub = Hub::new();
        let transport = Arc::new(InProcessTransport::shared());
        let bus = Arc::new(Bus::new(PodId::generate(), hub, transport));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::default());
        (TimerService::new(repo, bus, 5, 10), RoomId::new("sess-1"))
    }

    #[tokio::test]
    async fn pause_freezes_remaining_time() {
        let (service, room) = service().await;
        service.start(&room, 30).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.pause(&room).await.unwrap();
        let remaining_after_pause = {
            let timers = service.timers.lock();
            remaining_seconds(timers.get(&room).unwrap(), Instant::now())
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let remaining_later = {
            let timers = service.timers.lock();
            remaining_seconds(timers.get(&room).unwrap(), Instant::now())
        };
        assert_eq!(remaining_after_pause, remaining_later);
    }

    #[tokio::test]
    async fn pause_without_a_running_timer_is_an_error() {
        let (service, room) = service().await;
        assert!(service.pause(&room).await.is_err());
    }

    #[tokio::test]
    async fn add_time_extends_a_paused_timer() {
        let (service, room) = service().await;
        service.start(&room, 10).await.unwrap();
        service.pause(&room).await.unwrap();
        service.add_time(&room, 20).await.unwrap();
        let remaining = {
            let timers = service.timers.lock();
            remaining_seconds(timers.get(&room).unwrap(), Instant::now())
        };
        assert_eq!(remaining, 30);
    }

    #[tokio::test]
    async fn stop_clears_the_timer_and_is_idempotent() {
        let (service, room) = service().await;
        service.start(&room, 10).await.unwrap();
        service.stop(&room).await.unwrap();
        assert!(service.timers.lock().get(&room).is_none());
        service.stop(&room).await.unwrap();
    }
}
