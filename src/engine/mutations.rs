use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_stay};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_property(
        &self,
        id: Ulid,
        name: Option<String>,
        max_guests: Option<u32>,
    ) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        if self.state.len() >= MAX_PROPERTIES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many properties"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("property name too long"));
            }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::PropertyCreated { id, name: name.clone(), max_guests };
        self.wal_append(&event).await?;
        let ps = PropertyState::new(id, name, max_guests);
        self.state.insert(id, Arc::new(RwLock::new(ps)));
        tracing::info!("property {id} created");
        Ok(())
    }

    /// Apply `patch` on top of the current name and guest limit.
    pub async fn update_property(&self, id: Ulid, patch: PropertyPatch) -> Result<(), EngineError> {
        if let Some(Some(ref n)) = patch.name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("property name too long"));
            }
        let ps = self.get_property(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ps.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }

        let name = patch.name.unwrap_or_else(|| guard.name.clone());
        let max_guests = patch.max_guests.unwrap_or(guard.max_guests);
        let event = Event::PropertyUpdated { id, name, max_guests };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Only properties without requested or confirmed reservations can go.
    pub async fn delete_property(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let ps = self.get_property(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ps.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        if guard.has_active_reservations() {
            return Err(EngineError::HasActiveReservations(id));
        }

        let event = Event::PropertyDeleted { id };
        self.wal_append(&event).await?;
        self.unindex_property(&guard);
        guard.deleted = true;
        self.state.remove(&id);
        tracing::info!("property {id} deleted");
        Ok(())
    }

    /// Customer booking submission: the stay is recorded as requested, as
    /// long as it does not overlap a confirmed reservation.
    pub async fn request_reservation(&self, new: NewReservation) -> Result<(), EngineError> {
        self.create_reservation(new, ReservationStatus::Requested).await
    }

    /// Record a reservation directly in `status` (admins may book confirmed
    /// stays outright). The overlap check and the insert happen under the
    /// same property write lock.
    pub async fn create_reservation(
        &self,
        new: NewReservation,
        status: ReservationStatus,
    ) -> Result<(), EngineError> {
        if status == ReservationStatus::Cancelled {
            return Err(EngineError::InvalidTransition {
                id: new.id,
                from: ReservationStatus::Requested,
                to: status,
            });
        }
        let stay = validate_stay(new.check_in, new.check_out)?;
        if new.email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("email too long"));
        }
        if let Some(ref s) = new.special_requests
            && s.len() > MAX_SPECIAL_REQUESTS_LEN {
                return Err(EngineError::LimitExceeded("special requests too long"));
            }
        if new.guest_count == 0 || new.guest_count > MAX_GUEST_COUNT {
            return Err(EngineError::LimitExceeded("guest count out of range"));
        }

        let ps = self
            .get_property(&new.property_id)
            .ok_or(EngineError::NotFound(new.property_id))?;
        let mut guard = ps.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(new.property_id));
        }
        if self.reservation_to_property.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many reservations on property"));
        }
        if let Some(max) = guard.max_guests
            && new.guest_count > max {
                return Err(EngineError::GuestCountExceeded {
                    requested: new.guest_count,
                    max,
                });
            }

        if let Err(e) = check_no_conflict(&guard, &stay, None) {
            tracing::info!(
                "rejected {status} reservation {} on property {}: {e}",
                new.id,
                new.property_id
            );
            return Err(e);
        }

        let event = Event::ReservationCreated {
            id: new.id,
            property_id: new.property_id,
            stay,
            status,
            guest_count: new.guest_count,
            email: new.email,
            total_price: new.total_price,
            special_requests: new.special_requests,
            created_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Approve a requested reservation. The stay is re-checked against the
    /// other confirmed reservations, which may have appeared since it was
    /// requested.
    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (property_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let (status, stay) = guard
            .reservation(id)
            .map(|r| (r.status, r.stay))
            .ok_or(EngineError::NotFound(id))?;
        if status != ReservationStatus::Requested {
            return Err(EngineError::InvalidTransition {
                id,
                from: status,
                to: ReservationStatus::Confirmed,
            });
        }
        check_no_conflict(&guard, &stay, Some(id))?;

        let event = Event::ReservationConfirmed { id, property_id, at: now_ms() };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!("reservation {id} confirmed for {stay}");
        Ok(property_id)
    }

    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (property_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let status = guard
            .reservation(id)
            .map(|r| r.status)
            .ok_or(EngineError::NotFound(id))?;
        if status == ReservationStatus::Cancelled {
            return Err(EngineError::InvalidTransition {
                id,
                from: status,
                to: ReservationStatus::Cancelled,
            });
        }

        let event = Event::ReservationCancelled { id, property_id, at: now_ms() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(property_id)
    }

    /// Remove a reservation outright, whatever its status.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (property_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let event = Event::ReservationDeleted { id, property_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(property_id)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        // The catalog lock keeps properties from being created or deleted, and
        // the read guards keep reservations still, until the swap is done.
        let catalog = self.catalog.lock().await;
        let properties: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(properties.len());
        for ps in properties {
            guards.push(ps.read_owned().await);
        }
        for guard in guards.iter().filter(|g| !g.deleted) {
            events.push(Event::PropertyCreated {
                id: guard.id,
                name: guard.name.clone(),
                max_guests: guard.max_guests,
            });

            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    property_id: r.property_id,
                    stay: r.stay,
                    status: ReservationStatus::Requested,
                    guest_count: r.guest_count,
                    email: r.email.clone(),
                    total_price: r.total_price,
                    special_requests: r.special_requests.clone(),
                    created_at: r.created_at,
                });
                if let Some(at) = r.confirmed_at {
                    events.push(Event::ReservationConfirmed {
                        id: r.id,
                        property_id: r.property_id,
                        at,
                    });
                }
                if let Some(at) = r.cancelled_at {
                    events.push(Event::ReservationCancelled {
                        id: r.id,
                        property_id: r.property_id,
                        at,
                    });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        drop(catalog);
        tracing::info!("WAL compacted to {count} events");
        Ok(())
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
