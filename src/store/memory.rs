//! In-memory record store, for tests and hosts that persist elsewhere

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{LiveQueries, RecordStore, UserSnapshot};
use crate::error::StoreError;
use crate::observable::Observable;
use crate::types::{GoalId, GoalWeight, SampleId, User, UserId, WeightSample};

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    samples: BTreeMap<SampleId, WeightSample>,
    goals: BTreeMap<GoalId, GoalWeight>,
    next_user: i64,
    next_sample: i64,
    next_goal: i64,
}

impl Tables {
    fn snapshot(&self, user: UserId) -> UserSnapshot {
        let mut history: Vec<WeightSample> = self
            .samples
            .values()
            .filter(|s| s.user_id == user)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.recorded_on.cmp(&a.recorded_on));
        let goal = self.goals.values().find(|g| g.user_id == user).cloned();
        UserSnapshot::from_history(history, goal)
    }

    fn sample_on(&self, user: UserId, date: NaiveDate) -> Option<SampleId> {
        self.samples
            .values()
            .find(|s| s.user_id == user && s.recorded_on == date)
            .map(|s| s.id)
    }

    fn require_user(&self, user: UserId) -> Result<(), StoreError> {
        if self.users.contains_key(&user) {
            Ok(())
        } else {
            Err(StoreError::UserNotFound(user))
        }
    }
}

/// Record store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    live: LiveQueries,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queries(&self, user: UserId) -> Result<super::UserQueries, StoreError> {
        let tables = self.tables();
        self.live.get_or_load(user, || Ok(tables.snapshot(user)))
    }

    /// Capture `user`'s query results, release the tables, then publish
    fn republish(&self, tables: MutexGuard<'_, Tables>, user: UserId) {
        let staged = self.live.stage(user, || Ok(tables.snapshot(user)));
        drop(tables);
        // Loading from the tables cannot fail
        if let Ok(staged) = staged {
            self.live.publish(staged);
        }
    }
}

impl RecordStore for MemoryStore {
    fn latest_sample(&self, user: UserId) -> Result<Observable<Option<WeightSample>>, StoreError> {
        Ok(self.queries(user)?.latest)
    }

    fn earliest_sample(
        &self,
        user: UserId,
    ) -> Result<Observable<Option<WeightSample>>, StoreError> {
        Ok(self.queries(user)?.earliest)
    }

    fn goal(&self, user: UserId) -> Result<Observable<Option<GoalWeight>>, StoreError> {
        Ok(self.queries(user)?.goal)
    }

    fn history(&self, user: UserId) -> Result<Observable<Vec<WeightSample>>, StoreError> {
        Ok(self.queries(user)?.history)
    }

    fn sample(&self, id: SampleId) -> Result<Option<WeightSample>, StoreError> {
        Ok(self.tables().samples.get(&id).cloned())
    }

    fn write_sample(
        &self,
        user: UserId,
        value: f64,
        date: NaiveDate,
    ) -> Result<SampleId, StoreError> {
        let mut tables = self.tables();
        tables.require_user(user)?;

        let id = match tables.sample_on(user, date) {
            Some(existing) => existing,
            None => {
                tables.next_sample += 1;
                SampleId(tables.next_sample)
            }
        };
        tables.samples.insert(
            id,
            WeightSample {
                id,
                user_id: user,
                value,
                recorded_on: date,
            },
        );

        self.republish(tables, user);
        Ok(id)
    }

    fn update_sample(&self, id: SampleId, value: f64, date: NaiveDate) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let user = tables
            .samples
            .get(&id)
            .map(|s| s.user_id)
            .ok_or(StoreError::SampleNotFound(id))?;

        if matches!(tables.sample_on(user, date), Some(other) if other != id) {
            return Err(StoreError::DuplicateDate(date));
        }
        if let Some(sample) = tables.samples.get_mut(&id) {
            sample.value = value;
            sample.recorded_on = date;
        }

        self.republish(tables, user);
        Ok(())
    }

    fn delete_sample(&self, id: SampleId) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let removed = tables
            .samples
            .remove(&id)
            .ok_or(StoreError::SampleNotFound(id))?;
        self.republish(tables, removed.user_id);
        Ok(())
    }

    fn write_goal(&self, user: UserId, value: f64) -> Result<GoalId, StoreError> {
        let mut tables = self.tables();
        tables.require_user(user)?;

        let existing = tables.goals.values().find(|g| g.user_id == user).map(|g| g.id);
        let id = match existing {
            Some(id) => id,
            None => {
                tables.next_goal += 1;
                GoalId(tables.next_goal)
            }
        };
        tables.goals.insert(
            id,
            GoalWeight {
                id,
                user_id: user,
                value,
            },
        );

        self.republish(tables, user);
        Ok(id)
    }

    fn update_goal(&self, id: GoalId, value: f64) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let goal = tables
            .goals
            .get_mut(&id)
            .ok_or(StoreError::GoalNotFound(id))?;
        goal.value = value;
        let user = goal.user_id;

        self.republish(tables, user);
        Ok(())
    }

    fn register_user(&self, username: &str) -> Result<User, StoreError> {
        let mut tables = self.tables();
        if let Some(user) = tables.users.values().find(|u| u.username == username) {
            return Ok(user.clone());
        }
        tables.next_user += 1;
        let user = User {
            id: UserId(tables.next_user),
            username: username.to_string(),
        };
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    fn find_user(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .tables()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }
}
