use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use uuid::Uuid;

use crate::domain::clock::SharedClock;
use crate::domain::coordinator::catalog::experiment_catalog::ExperimentCatalog;
use crate::domain::coordinator::id::{ExperimentId, ReservationId};
use crate::domain::coordinator::reservation::reservation::{PostReservationRetrievedData, Reservation};
use crate::error::{Error, Result};

/// Bound on retries when a freshly generated reservation id collides with
/// an existing one. A collision is vanishingly unlikely, so hitting the
/// bound is treated as a fatal, logged condition instead of looping.
const MAX_ID_TRIES: u32 = 10;

#[derive(Debug, Default)]
struct StoreInner {
    /// Active reservations, keyed by their 36-character random id.
    reservations: HashMap<ReservationId, Arc<RwLock<Reservation>>>,

    /// Archived outcomes, retained until their expiration date passes.
    post_data: HashMap<ReservationId, PostReservationRetrievedData>,
}

/// Durable record of each reservation request and its payloads.
pub struct ReservationStore {
    inner: Arc<RwLock<StoreInner>>,
    experiments: ExperimentCatalog,
    clock: SharedClock,
    id_source: Arc<dyn Fn() -> String + Send + Sync>,
}

impl std::fmt::Debug for ReservationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationStore").field("inner", &self.inner).finish()
    }
}

impl ReservationStore {
    pub fn new(experiments: ExperimentCatalog, clock: SharedClock) -> Self {
        Self::with_id_source(experiments, clock, Arc::new(|| Uuid::new_v4().to_string()))
    }

    /// Same store with a custom id generator. Used by tests to simulate id
    /// collisions; production code keeps the uuid v4 source.
    pub fn with_id_source(experiments: ExperimentCatalog, clock: SharedClock, id_source: Arc<dyn Fn() -> String + Send + Sync>) -> Self {
        Self { inner: Arc::new(RwLock::new(StoreInner::default())), experiments, clock, id_source }
    }

    /// Creates a reservation for an existing experiment type.
    ///
    /// # Returns
    /// Returns the generated reservation id. Id collisions are retried up
    /// to `MAX_ID_TRIES` times, then reported as `Error::IdCollision`.
    pub fn create_reservation(&self, experiment_type: &ExperimentId, client_initial_data: Value, server_initial_data: Value, request_info: Value) -> Result<ReservationId> {
        if !self.experiments.has_type(experiment_type) {
            return Err(Error::ExperimentNotFound(experiment_type.to_string()));
        }

        let mut counter = 0;
        loop {
            let id = ReservationId::new((self.id_source)());
            let now = self.clock.now_millis();

            let mut guard = self.inner.write().expect("RwLock poisoned");
            if guard.reservations.contains_key(&id) {
                counter += 1;
                log::warn!("Reservation id {} collided with an existing reservation (attempt {}).", id, counter);
                if counter == MAX_ID_TRIES {
                    log::error!("Could not create a reservation after {} attempts. Giving up.", MAX_ID_TRIES);
                    return Err(Error::IdCollision(MAX_ID_TRIES));
                }
                continue;
            }

            let reservation = Reservation {
                id: id.clone(),
                experiment_type: experiment_type.clone(),
                latest_access: now,
                client_initial_data,
                server_initial_data,
                request_info,
            };
            guard.reservations.insert(id.clone(), Arc::new(RwLock::new(reservation)));

            return Ok(id);
        }
    }

    pub fn get(&self, id: &ReservationId) -> Option<Arc<RwLock<Reservation>>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.reservations.get(id).cloned()
    }

    pub fn experiment_type_of(&self, id: &ReservationId) -> Option<ExperimentId> {
        self.get(id).map(|handle| handle.read().expect("RwLock poisoned").experiment_type.clone())
    }

    /// Updates `latest_access` to the current time. Called on every status
    /// poll so the idle-expiry sweep sees live sessions.
    pub fn touch(&self, id: &ReservationId) -> Result<()> {
        let handle = self.get(id).ok_or_else(|| Error::ReservationNotFound(id.to_string()))?;
        handle.write().expect("RwLock poisoned").latest_access = self.clock.now_millis();
        Ok(())
    }

    /// Moves a reservation out of the active table into the post-reservation
    /// archive. Safe to call again for the same id: the archived row is
    /// replaced (disposal first archives with `finished = false`, then with
    /// the final data).
    pub fn archive_post_reservation(&self, data: PostReservationRetrievedData) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.reservations.remove(&data.reservation_id);
        guard.post_data.insert(data.reservation_id.clone(), data);
    }

    pub fn get_post_reservation(&self, id: &ReservationId) -> Option<PostReservationRetrievedData> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.post_data.get(id).cloned()
    }

    /// Drops archived rows whose expiration date has passed.
    ///
    /// # Returns
    /// Returns the number of rows removed.
    pub fn clean_expired_post_data(&self) -> usize {
        let now = self.clock.now_millis();
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let before = guard.post_data.len();
        guard.post_data.retain(|_, data| data.expiration_date > now);
        before - guard.post_data.len()
    }

    /// Active reservations whose `latest_access` is older than `cutoff`.
    /// The coordinator decides what to do with them (queue expiry).
    pub fn idle_since(&self, cutoff: i64) -> Vec<ReservationId> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard
            .reservations
            .values()
            .filter(|handle| handle.read().expect("RwLock poisoned").latest_access < cutoff)
            .map(|handle| handle.read().expect("RwLock poisoned").id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::WallClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn experiments_with_dummy() -> ExperimentCatalog {
        let experiments = ExperimentCatalog::new();
        experiments.register_experiment_type(ExperimentId::new("dummy1", "Dummy experiments"));
        experiments
    }

    fn dummy() -> ExperimentId {
        ExperimentId::new("dummy1", "Dummy experiments")
    }

    #[test]
    fn creation_fails_for_unknown_experiment_types() {
        let store = ReservationStore::new(ExperimentCatalog::new(), WallClock::shared());
        let result = store.create_reservation(&dummy(), json!({}), json!({}), json!({}));
        assert!(matches!(result, Err(Error::ExperimentNotFound(_))));
    }

    #[test]
    fn generated_ids_are_36_characters_and_unique() {
        let store = ReservationStore::new(experiments_with_dummy(), WallClock::shared());

        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = store.create_reservation(&dummy(), json!({}), json!({}), json!({})).unwrap();
            assert_eq!(id.to_string().len(), 36);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn collisions_are_retried_until_a_fresh_id_appears() {
        // First three draws produce the same id, then the source recovers.
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let source = Arc::new(move || {
            let n = counter_clone.fetch_add(1, Ordering::SeqCst);
            if n < 3 { format!("{:036}", 0) } else { format!("{:036}", n) }
        });

        let store = ReservationStore::with_id_source(experiments_with_dummy(), WallClock::shared(), source);

        let first = store.create_reservation(&dummy(), json!({}), json!({}), json!({})).unwrap();
        assert_eq!(first.to_string(), format!("{:036}", 0));

        let second = store.create_reservation(&dummy(), json!({}), json!({}), json!({})).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn collision_retries_are_bounded() {
        let source = Arc::new(|| format!("{:036}", 0));
        let store = ReservationStore::with_id_source(experiments_with_dummy(), WallClock::shared(), source);

        store.create_reservation(&dummy(), json!({}), json!({}), json!({})).unwrap();
        let result = store.create_reservation(&dummy(), json!({}), json!({}), json!({}));
        assert!(matches!(result, Err(Error::IdCollision(10))));
    }

    #[test]
    fn archiving_moves_the_reservation_out_of_the_active_table() {
        let store = ReservationStore::new(experiments_with_dummy(), WallClock::shared());
        let id = store.create_reservation(&dummy(), json!({}), json!({}), json!({})).unwrap();

        store.archive_post_reservation(PostReservationRetrievedData {
            reservation_id: id.clone(),
            finished: true,
            date: 1_000,
            expiration_date: i64::MAX,
            initial_data: json!({}),
            end_data: json!({}),
        });

        assert!(store.get(&id).is_none());
        assert!(store.get_post_reservation(&id).unwrap().finished);
        assert!(matches!(store.touch(&id), Err(Error::ReservationNotFound(_))));
    }

    #[test]
    fn expired_post_data_is_swept() {
        let store = ReservationStore::new(experiments_with_dummy(), WallClock::shared());
        let id = store.create_reservation(&dummy(), json!({}), json!({}), json!({})).unwrap();

        store.archive_post_reservation(PostReservationRetrievedData {
            reservation_id: id.clone(),
            finished: true,
            date: 0,
            expiration_date: 0,
            initial_data: json!({}),
            end_data: json!({}),
        });

        assert_eq!(store.clean_expired_post_data(), 1);
        assert!(store.get_post_reservation(&id).is_none());
    }
}
