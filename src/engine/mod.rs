mod availability;
mod conflict;
mod error;
mod filter;
mod mutations;
mod pricing;
mod queries;

pub use availability::{compute_daily_availability, day_slots, day_span, local_midnight_ms};
pub use conflict::{find_conflict, has_conflict};
pub use error::EngineError;
pub use filter::{BookingFilter, Predicate, calendar_predicate, matches_all};
pub use mutations::{BookingPatch, NewBooking, StudioPatch};
pub use pricing::{price_for_interval, round_to_cents};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedStudioState = Arc<RwLock<StudioState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel drained, flush the batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes
    // don't leak into the next batch. Callers are told this batch failed.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// In-memory booking store backed by the WAL.
///
/// Each studio's bookings live behind their own `RwLock`. Every write runs its
/// conflict check and applies its event while holding that studio's write
/// lock, so check-then-insert is atomic per studio.
pub struct Engine {
    pub state: DashMap<Ulid, SharedStudioState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → studio id
    pub(super) booking_to_studio: DashMap<Ulid, Ulid>,
}

/// Apply an event to a StudioState. Caller holds its write lock.
///
/// `BookingMoved` must be applied to both the source and destination studio.
fn apply_to_studio(ss: &mut StudioState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::StudioUpdated { studio } => {
            ss.studio = studio.clone();
        }
        Event::BookingCreated { booking } => {
            booking_index.insert(booking.id, booking.studio_id);
            ss.insert_booking(booking.clone());
        }
        Event::BookingUpdated { booking } => {
            ss.replace_booking(booking.clone());
        }
        Event::BookingMoved {
            from_studio_id,
            booking,
        } => {
            if ss.id() == *from_studio_id {
                ss.remove_booking(booking.id);
            } else {
                booking_index.insert(booking.id, booking.studio_id);
                ss.insert_booking(booking.clone());
            }
        }
        Event::BookingCancelled { id, reason, at, .. } => {
            if let Some(b) = ss.bookings.iter_mut().find(|b| b.id == *id) {
                b.status = BookingStatus::Cancelled;
                b.cancelled_reason = Some(reason.clone());
                b.updated_at = *at;
            }
        }
        // StudioCreated/Deleted are handled at the DashMap level, not here
        Event::StudioCreated { .. } | Event::StudioDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            booking_to_studio: DashMap::new(),
        };

        // We are the sole owner of these Arcs, so try_write never contends.
        // blocking_write would panic inside the runtime.
        for event in &events {
            engine.replay_event(event);
        }
        metrics::gauge!(crate::observability::STUDIOS_ACTIVE).set(engine.state.len() as f64);
        tracing::info!(
            "replayed {} events: {} studios, {} bookings",
            events.len(),
            engine.state.len(),
            engine.booking_to_studio.len()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::StudioCreated { studio } => {
                let ss = StudioState::new(studio.clone());
                self.state.insert(studio.id, Arc::new(RwLock::new(ss)));
            }
            Event::StudioDeleted { id } => {
                if let Some((_, ss)) = self.state.remove(id)
                    && let Ok(guard) = ss.try_read()
                {
                    for b in &guard.bookings {
                        self.booking_to_studio.remove(&b.id);
                    }
                }
            }
            Event::BookingMoved { from_studio_id, booking } => {
                for sid in [*from_studio_id, booking.studio_id] {
                    self.replay_on(sid, event);
                }
            }
            other => self.replay_on(other.studio_id(), other),
        }
    }

    fn replay_on(&self, studio_id: Ulid, event: &Event) {
        let Some(ss) = self.get_studio_state(&studio_id) else {
            tracing::warn!("replay: event for unknown studio {studio_id} skipped");
            return;
        };
        match ss.try_write() {
            Ok(mut guard) => apply_to_studio(&mut guard, event, &self.booking_to_studio),
            Err(_) => tracing::error!("replay: studio {studio_id} unexpectedly locked"),
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_studio_state(&self, id: &Ulid) -> Option<SharedStudioState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_studio_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_studio.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        ss: &mut StudioState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_studio(ss, event, &self.booking_to_studio);
        self.notify.publish(event);
        Ok(())
    }

    /// Lookup booking → studio, acquire that studio's write lock.
    ///
    /// Re-checks membership after locking: a concurrent move may have taken
    /// the booking elsewhere while we waited.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<StudioState>, EngineError> {
        for _ in 0..3 {
            let studio_id = self
                .get_studio_for_booking(booking_id)
                .ok_or(EngineError::NotFound(*booking_id))?;
            let ss = self
                .get_studio_state(&studio_id)
                .ok_or(EngineError::NotFound(studio_id))?;
            let guard = ss.write_owned().await;
            if guard.get_booking(booking_id).is_some() {
                return Ok(guard);
            }
        }
        Err(EngineError::NotFound(*booking_id))
    }
}
