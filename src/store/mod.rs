//! Record store
//!
//! Durable storage of users, weight samples and goal weights. Reads are exposed
//! as live queries: each query is an [`Observable`] that the store republishes
//! after every mutation affecting its user, so consumers never re-issue queries.
//!
//! Back ends capture the new query results under their data lock and publish them
//! after releasing it, so observers may read the store from their callbacks.
//! Callbacks must not write to the store.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{DatabaseHealth, SqliteStore};

use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::StoreError;
use crate::observable::Observable;
use crate::types::{GoalId, GoalWeight, SampleId, User, UserId, WeightSample};

/// Storage interface consumed by the metrics engine and the session
pub trait RecordStore: Send + Sync {
    /// Live query: the user's most recent sample
    fn latest_sample(&self, user: UserId) -> Result<Observable<Option<WeightSample>>, StoreError>;

    /// Live query: the user's earliest sample
    fn earliest_sample(&self, user: UserId)
        -> Result<Observable<Option<WeightSample>>, StoreError>;

    /// Live query: the user's goal weight
    fn goal(&self, user: UserId) -> Result<Observable<Option<GoalWeight>>, StoreError>;

    /// Live query: every sample of the user, newest first
    fn history(&self, user: UserId) -> Result<Observable<Vec<WeightSample>>, StoreError>;

    /// Point lookup of a single sample
    fn sample(&self, id: SampleId) -> Result<Option<WeightSample>, StoreError>;

    /// Record a sample. A second sample on the same date replaces that day's value.
    fn write_sample(&self, user: UserId, value: f64, date: NaiveDate)
        -> Result<SampleId, StoreError>;

    /// Change the value and date of an existing sample
    fn update_sample(&self, id: SampleId, value: f64, date: NaiveDate) -> Result<(), StoreError>;

    fn delete_sample(&self, id: SampleId) -> Result<(), StoreError>;

    /// Set the user's goal, replacing any existing one
    fn write_goal(&self, user: UserId, value: f64) -> Result<GoalId, StoreError>;

    fn update_goal(&self, id: GoalId, value: f64) -> Result<(), StoreError>;

    fn register_user(&self, username: &str) -> Result<User, StoreError>;

    fn find_user(&self, username: &str) -> Result<Option<User>, StoreError>;
}

/// Result of running every live query for one user
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserSnapshot {
    pub latest: Option<WeightSample>,
    pub earliest: Option<WeightSample>,
    pub goal: Option<GoalWeight>,
    /// Newest first
    pub history: Vec<WeightSample>,
}

impl UserSnapshot {
    /// Build a snapshot from a history sorted newest first
    pub fn from_history(history: Vec<WeightSample>, goal: Option<GoalWeight>) -> Self {
        Self {
            latest: history.first().cloned(),
            earliest: history.last().cloned(),
            goal,
            history,
        }
    }
}

/// Observables backing the live queries of one user
#[derive(Debug, Clone)]
pub struct UserQueries {
    pub latest: Observable<Option<WeightSample>>,
    pub earliest: Observable<Option<WeightSample>>,
    pub goal: Observable<Option<GoalWeight>>,
    pub history: Observable<Vec<WeightSample>>,
}

impl UserQueries {
    fn seeded(snapshot: UserSnapshot) -> Self {
        Self {
            latest: Observable::new(snapshot.latest),
            earliest: Observable::new(snapshot.earliest),
            goal: Observable::new(snapshot.goal),
            history: Observable::new(snapshot.history),
        }
    }

    fn publish(&self, snapshot: UserSnapshot) {
        // History first, so observers of the single-row queries can read it fresh
        self.history.set(snapshot.history);
        self.latest.set(snapshot.latest);
        self.earliest.set(snapshot.earliest);
        self.goal.set(snapshot.goal);
    }
}

/// Query results captured under a back end's data lock, waiting to be published
#[derive(Debug)]
#[must_use = "staged results are only seen by observers once published"]
pub struct Staged {
    user: UserId,
    revision: u64,
    snapshot: UserSnapshot,
}

/// Registry of live queries, keyed by user.
///
/// Back ends call [`LiveQueries::stage`] while holding their data lock, which
/// numbers the results in mutation order, and [`LiveQueries::publish`] after
/// releasing it. A staged result older than one already published is dropped,
/// so observers never step back to an earlier state.
#[derive(Debug, Default)]
pub struct LiveQueries {
    users: Mutex<HashMap<UserId, UserQueries>>,
    revision: AtomicU64,
    /// Last published revision per user; also serializes publication
    published: Mutex<HashMap<UserId, u64>>,
}

impl LiveQueries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries for `user`, running `load` to seed them on first use
    pub fn get_or_load(
        &self,
        user: UserId,
        load: impl FnOnce() -> Result<UserSnapshot, StoreError>,
    ) -> Result<UserQueries, StoreError> {
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(queries) = users.get(&user) {
            return Ok(queries.clone());
        }
        let queries = UserQueries::seeded(load()?);
        users.insert(user, queries.clone());
        Ok(queries)
    }

    /// Whether anything has asked for this user's queries yet
    pub fn is_live(&self, user: UserId) -> bool {
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&user)
    }

    /// Re-run the user's queries with `load`. Call under the data lock that
    /// covers the mutation. Returns `None` when nobody observes the user.
    pub fn stage(
        &self,
        user: UserId,
        load: impl FnOnce() -> Result<UserSnapshot, StoreError>,
    ) -> Result<Option<Staged>, StoreError> {
        if !self.is_live(user) {
            return Ok(None);
        }
        let snapshot = load()?;
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(Staged {
            user,
            revision,
            snapshot,
        }))
    }

    /// Push staged results to the user's observers. Call without the data lock.
    pub fn publish(&self, staged: Option<Staged>) {
        let Some(Staged {
            user,
            revision,
            snapshot,
        }) = staged
        else {
            return;
        };

        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        let last = published.entry(user).or_insert(0);
        if *last >= revision {
            tracing::debug!(user = %user, revision, latest = *last, "skipping superseded query results");
            return;
        }
        *last = revision;

        let queries = self
            .users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user)
            .cloned();
        if let Some(queries) = queries {
            tracing::debug!(user = %user, revision, samples = snapshot.history.len(), "publishing live queries");
            queries.publish(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: i64, value: f64, day: u32) -> WeightSample {
        WeightSample {
            id: SampleId(id),
            user_id: UserId(1),
            value,
            recorded_on: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
        }
    }

    #[test]
    fn test_snapshot_from_history() {
        let snapshot = UserSnapshot::from_history(
            vec![sample(3, 180.0, 20), sample(2, 190.0, 10), sample(1, 200.0, 1)],
            None,
        );
        assert_eq!(snapshot.latest.unwrap().value, 180.0);
        assert_eq!(snapshot.earliest.unwrap().value, 200.0);
    }

    #[test]
    fn test_get_or_load_loads_once() {
        let live = LiveQueries::new();
        let first = live
            .get_or_load(UserId(1), || Ok(UserSnapshot::default()))
            .unwrap();
        let second = live
            .get_or_load(UserId(1), || panic!("loaded twice"))
            .unwrap();
        assert!(first.latest.same_as(&second.latest));
        assert!(live.is_live(UserId(1)));
        assert!(!live.is_live(UserId(2)));
    }

    #[test]
    fn test_stage_skips_users_without_queries() {
        let live = LiveQueries::new();
        let staged = live
            .stage(UserId(9), || panic!("loaded without observers"))
            .unwrap();
        assert!(staged.is_none());
        live.publish(staged);
        assert!(!live.is_live(UserId(9)));
    }

    #[test]
    fn test_superseded_results_are_dropped() {
        let live = LiveQueries::new();
        let queries = live
            .get_or_load(UserId(1), || Ok(UserSnapshot::default()))
            .unwrap();

        let older = live
            .stage(UserId(1), || Ok(UserSnapshot::from_history(vec![sample(1, 200.0, 1)], None)))
            .unwrap();
        let newer = live
            .stage(UserId(1), || {
                Ok(UserSnapshot::from_history(
                    vec![sample(2, 190.0, 2), sample(1, 200.0, 1)],
                    None,
                ))
            })
            .unwrap();

        // Published out of order: the older result must not overwrite the newer one
        live.publish(newer);
        live.publish(older);
        assert_eq!(queries.latest.get().unwrap().value, 190.0);
        assert_eq!(queries.history.get().len(), 2);
    }
}
