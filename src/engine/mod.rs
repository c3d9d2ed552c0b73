mod availability;
mod calendar;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{merge_adjacent, open_ranges, subtract_ranges};
pub use calendar::{aggregate_month, MonthWindow};
pub use conflict::{find_conflicts, validate_stay};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedPropertyState = Arc<RwLock<PropertyState>>;

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
/// 5. Respond to all senders.
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
                            // Flush what we have before handling the non-append command
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("WAL flush failed for {} events: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
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
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedPropertyState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation id → property id
    pub(super) reservation_to_property: DashMap<Ulid, Ulid>,
    /// Serializes property create/delete with each other and with compaction.
    pub(super) catalog: Mutex<()>,
}

/// Apply an event directly to a PropertyState (no locking, caller holds the lock).
fn apply_to_property(ps: &mut PropertyState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCreated {
            id,
            property_id,
            stay,
            status,
            guest_count,
            email,
            total_price,
            special_requests,
            created_at,
        } => {
            ps.insert_reservation(Reservation {
                id: *id,
                property_id: *property_id,
                stay: *stay,
                status: *status,
                guest_count: *guest_count,
                email: email.clone(),
                total_price: *total_price,
                special_requests: special_requests.clone(),
                created_at: *created_at,
                confirmed_at: (*status == ReservationStatus::Confirmed).then_some(*created_at),
                cancelled_at: (*status == ReservationStatus::Cancelled).then_some(*created_at),
            });
            index.insert(*id, *property_id);
        }
        Event::ReservationConfirmed { id, at, .. } => {
            if let Some(r) = ps.reservation_mut(*id) {
                r.status = ReservationStatus::Confirmed;
                r.confirmed_at = Some(*at);
            }
        }
        Event::ReservationCancelled { id, at, .. } => {
            if let Some(r) = ps.reservation_mut(*id) {
                r.status = ReservationStatus::Cancelled;
                r.cancelled_at = Some(*at);
            }
        }
        Event::ReservationDeleted { id, .. } => {
            ps.remove_reservation(*id);
            index.remove(id);
        }
        Event::PropertyUpdated { name, max_guests, .. } => {
            ps.name = name.clone();
            ps.max_guests = *max_guests;
        }
        // PropertyCreated/Deleted are handled at the DashMap level, not here
        Event::PropertyCreated { .. } | Event::PropertyDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            reservation_to_property: DashMap::new(),
            catalog: Mutex::new(()),
        };

        // Replay: we're the sole owner of these Arcs, so try_write always
        // succeeds. Never block here, this may run inside an async context
        // (lazy tenant creation).
        for event in &events {
            match event {
                Event::PropertyCreated { id, name, max_guests } => {
                    let ps = PropertyState::new(*id, name.clone(), *max_guests);
                    engine.state.insert(*id, Arc::new(RwLock::new(ps)));
                }
                Event::PropertyDeleted { id } => {
                    if let Some((_, ps)) = engine.state.remove(id)
                        && let Ok(guard) = ps.try_read() {
                            engine.unindex_property(&guard);
                        }
                }
                other => {
                    if let Some(property_id) = event_property_id(other)
                        && let Some(entry) = engine.state.get(&property_id) {
                            let ps = entry.clone();
                            drop(entry);
                            if let Ok(mut guard) = ps.try_write() {
                                apply_to_property(&mut guard, other, &engine.reservation_to_property);
                            }
                        }
                }
            }
        }

        tracing::debug!(
            "replayed {} events into {} properties from {}",
            events.len(),
            engine.state.len(),
            wal_path.display()
        );
        Ok(engine)
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

    pub fn get_property(&self, id: &Ulid) -> Option<SharedPropertyState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_property_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_property
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut PropertyState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_property(ps, event, &self.reservation_to_property);
        Ok(())
    }

    /// Lookup reservation → property, get property, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<PropertyState>), EngineError> {
        let property_id = self
            .get_property_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let ps = self
            .get_property(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = ps.write_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound(*reservation_id));
        }
        Ok((property_id, guard))
    }

    fn unindex_property(&self, ps: &PropertyState) {
        for r in &ps.reservations {
            self.reservation_to_property.remove(&r.id);
        }
    }
}

/// Extract the property id from an event (for non-Create/Delete events).
fn event_property_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationCreated { property_id, .. }
        | Event::ReservationConfirmed { property_id, .. }
        | Event::ReservationCancelled { property_id, .. }
        | Event::ReservationDeleted { property_id, .. } => Some(*property_id),
        Event::PropertyUpdated { id, .. } => Some(*id),
        Event::PropertyCreated { .. } | Event::PropertyDeleted { .. } => None,
    }
}
