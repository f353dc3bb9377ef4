use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::pricing::{price_for_interval, round_to_cents};
use super::{Engine, EngineError, WalCommand, apply_to_studio};

/// Request to reserve a studio interval. Bounds are validated by the engine.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub id: Ulid,
    pub studio_id: Ulid,
    pub client_id: Ulid,
    pub engineer_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub notes: Option<String>,
    pub equipment_ids: Vec<Ulid>,
}

/// Partial booking update. Unset fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingPatch {
    pub studio_id: Option<Ulid>,
    pub engineer_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub notes: Option<String>,
    pub status: Option<BookingStatus>,
    pub equipment_ids: Option<Vec<Ulid>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudioPatch {
    pub name: Option<String>,
    pub hourly_rate: Option<f64>,
    pub opening_hour: Option<u8>,
    pub closing_hour: Option<u8>,
    pub utc_offset_secs: Option<i32>,
}

fn validate_studio(studio: &Studio) -> Result<(), EngineError> {
    if studio.name.trim().is_empty() {
        return Err(EngineError::Invalid("studio name is empty"));
    }
    if studio.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("studio name too long"));
    }
    if !studio.hourly_rate.is_finite() || studio.hourly_rate < 0.0 {
        return Err(EngineError::Invalid("hourly rate must be a non-negative number"));
    }
    if !studio.window().is_valid() {
        return Err(EngineError::Invalid(
            "opening hours must satisfy 0 <= opening < closing <= 24",
        ));
    }
    if studio.utc_offset_secs.abs() > MAX_UTC_OFFSET_SECS {
        return Err(EngineError::Invalid("utc offset out of range"));
    }
    Ok(())
}

fn validate_details(notes: Option<&str>, equipment_ids: &[Ulid]) -> Result<(), EngineError> {
    if notes.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    if equipment_ids.len() > MAX_EQUIPMENT_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many equipment items"));
    }
    Ok(())
}

fn quote(studio: &Studio, span: &Span) -> f64 {
    round_to_cents(price_for_interval(studio.hourly_rate, span))
}

/// A booking id claimed in the booking index before its studio is locked.
/// Released on drop unless the booking was committed.
struct IdClaim<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    committed: bool,
}

impl<'a> IdClaim<'a> {
    fn take(index: &'a DashMap<Ulid, Ulid>, id: Ulid, studio_id: Ulid) -> Result<Self, EngineError> {
        match index.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(studio_id);
                Ok(Self {
                    index,
                    id,
                    committed: false,
                })
            }
        }
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.index.remove(&self.id);
        }
    }
}

impl Engine {
    // ── Studio directory ─────────────────────────────────────

    pub async fn create_studio(&self, studio: Studio) -> Result<Studio, EngineError> {
        validate_studio(&studio)?;
        if self.state.len() >= MAX_STUDIOS {
            return Err(EngineError::LimitExceeded("too many studios"));
        }

        // The entry is claimed with its lock already held, so a concurrent
        // create of the same id fails and compaction waits for the WAL append.
        let ss = Arc::new(RwLock::new(StudioState::new(studio.clone())));
        let guard = ss.clone().write_owned().await;
        match self.state.entry(studio.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(studio.id)),
            Entry::Vacant(slot) => {
                slot.insert(ss);
            }
        }

        let event = Event::StudioCreated { studio: studio.clone() };
        if let Err(e) = self.wal_append(&event).await {
            self.state.remove(&studio.id);
            return Err(e);
        }
        drop(guard);
        metrics::gauge!(crate::observability::STUDIOS_ACTIVE).increment(1.0);
        self.notify.publish(&event);
        info!("studio {} created ({})", studio.id, studio.name);
        Ok(studio)
    }

    pub async fn update_studio(&self, id: Ulid, patch: StudioPatch) -> Result<Studio, EngineError> {
        let ss = self.get_studio_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ss.write().await;

        let mut studio = guard.studio.clone();
        if let Some(name) = patch.name {
            studio.name = name;
        }
        if let Some(rate) = patch.hourly_rate {
            studio.hourly_rate = rate;
        }
        if let Some(h) = patch.opening_hour {
            studio.opening_hour = h;
        }
        if let Some(h) = patch.closing_hour {
            studio.closing_hour = h;
        }
        if let Some(offset) = patch.utc_offset_secs {
            studio.utc_offset_secs = offset;
        }
        validate_studio(&studio)?;

        let event = Event::StudioUpdated { studio: studio.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(studio)
    }

    /// Remove a studio and its booking history. Refused while any booking is active.
    pub async fn delete_studio(&self, id: Ulid) -> Result<(), EngineError> {
        let ss = self.get_studio_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ss.write().await;
        if guard.has_active_bookings() {
            return Err(EngineError::HasActiveBookings(id));
        }

        let event = Event::StudioDeleted { id };
        self.wal_append(&event).await?;
        for b in &guard.bookings {
            self.booking_to_studio.remove(&b.id);
        }
        self.state.remove(&id);
        metrics::gauge!(crate::observability::STUDIOS_ACTIVE).decrement(1.0);
        self.notify.publish(&event);
        self.notify.remove(&id);
        info!("studio {id} deleted");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Validate, conflict-check and insert a new pending booking atomically.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let span = validate_span(req.start, req.end)?;
        validate_details(req.notes.as_deref(), &req.equipment_ids)?;
        let mut claim = IdClaim::take(&self.booking_to_studio, req.id, req.studio_id)?;
        let ss = self
            .get_studio_state(&req.studio_id)
            .ok_or(EngineError::NotFound(req.studio_id))?;
        let mut guard = ss.write().await;
        if !self.state.contains_key(&req.studio_id) {
            return Err(EngineError::NotFound(req.studio_id)); // deleted while we waited
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_STUDIO {
            return Err(EngineError::LimitExceeded("too many bookings on studio"));
        }

        check_no_conflict(&guard, &span, None)?;

        let now = now_ms();
        let booking = Booking {
            id: req.id,
            studio_id: req.studio_id,
            client_id: req.client_id,
            engineer_id: req.engineer_id,
            span,
            status: BookingStatus::Pending,
            notes: req.notes,
            total_price: quote(&guard.studio, &span),
            is_paid: false,
            cancelled_reason: None,
            equipment_ids: req.equipment_ids,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated { booking: booking.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        claim.committed = true;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            "booking {} created on studio {} [{}, {})",
            booking.id, booking.studio_id, span.start, span.end
        );
        Ok(booking)
    }

    /// Apply a partial update. The new interval is conflict-checked (excluding
    /// the booking itself) only when studio, start or end actually change.
    pub async fn update_booking(&self, id: Ulid, patch: BookingPatch) -> Result<Booking, EngineError> {
        validate_details(
            patch.notes.as_deref(),
            patch.equipment_ids.as_deref().unwrap_or(&[]),
        )?;

        let mut source = self.resolve_booking_write(&id).await?;
        let from_studio_id = source.id();
        let target_studio_id = patch.studio_id.unwrap_or(from_studio_id);

        let mut target: Option<OwnedRwLockWriteGuard<StudioState>> = None;
        if target_studio_id != from_studio_id {
            let target_ss = self
                .get_studio_state(&target_studio_id)
                .ok_or(EngineError::NotFound(target_studio_id))?;
            // Locks are taken in id order; release and re-take if we hold the larger id.
            if target_studio_id < from_studio_id {
                let from_ss = self
                    .get_studio_state(&from_studio_id)
                    .ok_or(EngineError::NotFound(from_studio_id))?;
                drop(source);
                let t = target_ss.write_owned().await;
                source = from_ss.write_owned().await;
                if source.get_booking(&id).is_none() {
                    return Err(EngineError::Invalid("booking moved concurrently, retry"));
                }
                target = Some(t);
            } else {
                target = Some(target_ss.write_owned().await);
            }
        }

        let existing = source
            .get_booking(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if existing.status.is_terminal() {
            return Err(EngineError::Terminal {
                op: "update",
                status: existing.status,
            });
        }

        let status = match patch.status {
            None => existing.status,
            Some(s) if s == existing.status => s,
            Some(BookingStatus::Cancelled) => {
                return Err(EngineError::InvalidTransition {
                    from: existing.status,
                    to: BookingStatus::Cancelled,
                });
            }
            Some(s) if existing.status.can_transition_to(s) => s,
            Some(s) => {
                return Err(EngineError::InvalidTransition {
                    from: existing.status,
                    to: s,
                });
            }
        };

        let span = if patch.start.is_some() || patch.end.is_some() {
            validate_span(
                patch.start.unwrap_or(existing.span.start),
                patch.end.unwrap_or(existing.span.end),
            )?
        } else {
            existing.span
        };
        let relocated = target.is_some() || span != existing.span;

        let mut updated = existing.clone();
        updated.studio_id = target_studio_id;
        updated.span = span;
        updated.status = status;
        if let Some(engineer_id) = patch.engineer_id {
            updated.engineer_id = Some(engineer_id);
        }
        if let Some(notes) = patch.notes {
            updated.notes = Some(notes);
        }
        if let Some(equipment_ids) = patch.equipment_ids {
            updated.equipment_ids = equipment_ids;
        }
        updated.updated_at = now_ms();

        if relocated {
            let dest: &StudioState = target.as_deref().unwrap_or(&*source);
            check_no_conflict(dest, &span, Some(id))?;
            updated.total_price = quote(&dest.studio, &span);
        }

        match target.as_mut() {
            None => {
                let event = Event::BookingUpdated { booking: updated.clone() };
                self.persist_and_apply(&mut source, &event).await?;
            }
            Some(dest) => {
                if dest.bookings.len() >= MAX_BOOKINGS_PER_STUDIO {
                    return Err(EngineError::LimitExceeded("too many bookings on studio"));
                }
                let event = Event::BookingMoved {
                    from_studio_id,
                    booking: updated.clone(),
                };
                self.wal_append(&event).await?;
                apply_to_studio(&mut source, &event, &self.booking_to_studio);
                apply_to_studio(dest, &event, &self.booking_to_studio);
                self.notify.publish(&event);
                metrics::counter!(crate::observability::BOOKINGS_MOVED_TOTAL).increment(1);
                info!("booking {id} moved from studio {from_studio_id} to {target_studio_id}");
            }
        }
        Ok(updated)
    }

    pub async fn cancel_booking(&self, id: Ulid, reason: Option<String>) -> Result<Booking, EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }
        let mut guard = self.resolve_booking_write(&id).await?;
        let existing = guard.get_booking(&id).ok_or(EngineError::NotFound(id))?;
        if existing.status.is_terminal() {
            return Err(EngineError::Terminal {
                op: "cancel",
                status: existing.status,
            });
        }

        let event = Event::BookingCancelled {
            id,
            studio_id: guard.id(),
            reason: reason.unwrap_or_else(|| "Cancelled by user".to_string()),
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("booking {id} cancelled");
        guard.get_booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn mark_paid(&self, id: Ulid) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        let mut booking = guard.get_booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::Terminal {
                op: "pay for",
                status: booking.status,
            });
        }
        if booking.is_paid {
            return Ok(booking);
        }
        booking.is_paid = true;
        booking.updated_at = now_ms();

        let event = Event::BookingUpdated { booking: booking.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(booking)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        let mut seen = HashSet::new();
        // Read guards are held until the swap so no append slips in between
        // the snapshot and the rename. Taken in id order like every multi-lock.
        let mut guards = Vec::new();

        let mut studio_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        studio_ids.sort();
        for id in studio_ids {
            let Some(ss) = self.get_studio_state(&id) else { continue };
            let guard = ss.read_owned().await;
            if !self.state.contains_key(&id) {
                continue; // deleted while we waited
            }
            events.push(Event::StudioCreated {
                studio: guard.studio.clone(),
            });
            for booking in &guard.bookings {
                if seen.insert(booking.id) {
                    events.push(Event::BookingCreated {
                        booking: booking.clone(),
                    });
                }
            }
            guards.push(guard);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
