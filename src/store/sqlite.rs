//! SQLite record store
//!
//! Holds one `rusqlite::Connection` behind a mutex. Schema and WAL mode are set up
//! when the store is opened. Dates are stored as ISO `YYYY-MM-DD` text so that
//! ordering by the column is chronological.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{LiveQueries, RecordStore, Staged, UserQueries, UserSnapshot};
use crate::error::StoreError;
use crate::observable::Observable;
use crate::types::{GoalId, GoalWeight, SampleId, User, UserId, WeightSample};

const DATE_FORMAT: &str = "%Y-%m-%d";

const TABLES: [&str; 3] = ["users", "weights", "goal_weights"];

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id       INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT    NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS weights (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        weight      REAL    NOT NULL,
        recorded_on TEXT    NOT NULL,
        UNIQUE (user_id, recorded_on)
    );
    CREATE TABLE IF NOT EXISTS goal_weights (
        id      INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
        weight  REAL    NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_weights_user_date
        ON weights(user_id, recorded_on DESC);";

/// Record store persisted in a SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
    live: LiveQueries,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        // WAL keeps readers from blocking on the single writer
        conn.pragma_update(None, "journal_mode", "WAL")?;
        tracing::info!(path = %path.as_ref().display(), "opened weight database");
        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            live: LiveQueries::new(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queries(&self, user: UserId) -> Result<UserQueries, StoreError> {
        let conn = self.conn();
        self.live.get_or_load(user, || load_snapshot(&conn, user))
    }

    /// Check the database at `path` without creating or migrating it
    pub fn inspect<P: AsRef<Path>>(path: P) -> Result<DatabaseHealth, StoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(DatabaseHealth::Missing);
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let mut missing = Vec::new();
        for table in TABLES {
            let exists = conn
                .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?
                .exists(params![table])?;
            if !exists {
                missing.push(table.to_string());
            }
        }

        if missing.is_empty() {
            Ok(DatabaseHealth::Ready)
        } else {
            Ok(DatabaseHealth::MissingTables(missing))
        }
    }
}

/// Result of [`SqliteStore::inspect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseHealth {
    /// No file at the path yet; opening the store will create it
    Missing,
    /// Every table is present
    Ready,
    /// The file exists but lacks these tables
    MissingTables(Vec<String>),
}

/// Re-run `user`'s queries inside `tx`, then commit. A failed re-query rolls the
/// mutation back, so a write either persists and is published or does neither.
fn commit_staged(
    tx: Transaction<'_>,
    live: &LiveQueries,
    user: UserId,
) -> Result<Option<Staged>, StoreError> {
    let staged = live.stage(user, || load_snapshot(&tx, user))?;
    tx.commit()?;
    Ok(staged)
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, i64, f64, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn to_sample((id, user_id, value, date): (i64, i64, f64, String)) -> Result<WeightSample, StoreError> {
    let recorded_on = NaiveDate::parse_from_str(&date, DATE_FORMAT)
        .map_err(|e| StoreError::InvalidRow(format!("weights.recorded_on '{}': {}", date, e)))?;
    Ok(WeightSample {
        id: SampleId(id),
        user_id: UserId(user_id),
        value,
        recorded_on,
    })
}

fn load_history(conn: &Connection, user: UserId) -> Result<Vec<WeightSample>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, user_id, weight, recorded_on FROM weights
         WHERE user_id = ?1 ORDER BY recorded_on DESC",
    )?;
    let rows = stmt
        .query_map(params![user.0], sample_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(to_sample).collect()
}

fn load_goal(conn: &Connection, user: UserId) -> Result<Option<GoalWeight>, StoreError> {
    let goal = conn
        .prepare_cached("SELECT id, user_id, weight FROM goal_weights WHERE user_id = ?1")?
        .query_row(params![user.0], |row| {
            Ok(GoalWeight {
                id: GoalId(row.get(0)?),
                user_id: UserId(row.get(1)?),
                value: row.get(2)?,
            })
        })
        .optional()?;
    Ok(goal)
}

fn load_snapshot(conn: &Connection, user: UserId) -> Result<UserSnapshot, StoreError> {
    Ok(UserSnapshot::from_history(
        load_history(conn, user)?,
        load_goal(conn, user)?,
    ))
}

fn require_user(conn: &Connection, user: UserId) -> Result<(), StoreError> {
    let exists = conn
        .prepare_cached("SELECT 1 FROM users WHERE id = ?1")?
        .exists(params![user.0])?;
    if exists {
        Ok(())
    } else {
        Err(StoreError::UserNotFound(user))
    }
}

fn find_sample(conn: &Connection, id: SampleId) -> Result<Option<WeightSample>, StoreError> {
    let row = conn
        .prepare_cached("SELECT id, user_id, weight, recorded_on FROM weights WHERE id = ?1")?
        .query_row(params![id.0], sample_from_row)
        .optional()?;
    row.map(to_sample).transpose()
}

impl RecordStore for SqliteStore {
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
        find_sample(&self.conn(), id)
    }

    fn write_sample(
        &self,
        user: UserId,
        value: f64,
        date: NaiveDate,
    ) -> Result<SampleId, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        require_user(&tx, user)?;
        let id: i64 = tx
            .prepare_cached(
                "INSERT INTO weights (user_id, weight, recorded_on) VALUES (?1, ?2, ?3)
                 ON CONFLICT (user_id, recorded_on) DO UPDATE SET weight = excluded.weight
                 RETURNING id",
            )?
            .query_row(params![user.0, value, format_date(date)], |row| row.get(0))?;
        let staged = commit_staged(tx, &self.live, user)?;
        drop(conn);

        tracing::debug!(user = %user, sample = id, %date, value, "wrote weight sample");
        self.live.publish(staged);
        Ok(SampleId(id))
    }

    fn update_sample(&self, id: SampleId, value: f64, date: NaiveDate) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let sample = find_sample(&tx, id)?.ok_or(StoreError::SampleNotFound(id))?;

        let taken = tx
            .prepare_cached(
                "SELECT 1 FROM weights WHERE user_id = ?1 AND recorded_on = ?2 AND id != ?3",
            )?
            .exists(params![sample.user_id.0, format_date(date), id.0])?;
        if taken {
            return Err(StoreError::DuplicateDate(date));
        }

        tx.prepare_cached("UPDATE weights SET weight = ?1, recorded_on = ?2 WHERE id = ?3")?
            .execute(params![value, format_date(date), id.0])?;
        let staged = commit_staged(tx, &self.live, sample.user_id)?;
        drop(conn);

        tracing::debug!(sample = %id, %date, value, "updated weight sample");
        self.live.publish(staged);
        Ok(())
    }

    fn delete_sample(&self, id: SampleId) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let sample = find_sample(&tx, id)?.ok_or(StoreError::SampleNotFound(id))?;
        tx.prepare_cached("DELETE FROM weights WHERE id = ?1")?
            .execute(params![id.0])?;
        let staged = commit_staged(tx, &self.live, sample.user_id)?;
        drop(conn);

        tracing::debug!(sample = %id, "deleted weight sample");
        self.live.publish(staged);
        Ok(())
    }

    fn write_goal(&self, user: UserId, value: f64) -> Result<GoalId, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        require_user(&tx, user)?;
        let id: i64 = tx
            .prepare_cached(
                "INSERT INTO goal_weights (user_id, weight) VALUES (?1, ?2)
                 ON CONFLICT (user_id) DO UPDATE SET weight = excluded.weight
                 RETURNING id",
            )?
            .query_row(params![user.0, value], |row| row.get(0))?;
        let staged = commit_staged(tx, &self.live, user)?;
        drop(conn);

        tracing::debug!(user = %user, goal = id, value, "wrote goal weight");
        self.live.publish(staged);
        Ok(GoalId(id))
    }

    fn update_goal(&self, id: GoalId, value: f64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let user: i64 = tx
            .prepare_cached("SELECT user_id FROM goal_weights WHERE id = ?1")?
            .query_row(params![id.0], |row| row.get(0))
            .optional()?
            .ok_or(StoreError::GoalNotFound(id))?;
        tx.prepare_cached("UPDATE goal_weights SET weight = ?1 WHERE id = ?2")?
            .execute(params![value, id.0])?;
        let staged = commit_staged(tx, &self.live, UserId(user))?;
        drop(conn);

        tracing::debug!(goal = %id, value, "updated goal weight");
        self.live.publish(staged);
        Ok(())
    }

    fn register_user(&self, username: &str) -> Result<User, StoreError> {
        let conn = self.conn();
        let id: i64 = conn
            .prepare_cached(
                "INSERT INTO users (username) VALUES (?1)
                 ON CONFLICT (username) DO UPDATE SET username = excluded.username
                 RETURNING id",
            )?
            .query_row(params![username], |row| row.get(0))?;
        Ok(User {
            id: UserId(id),
            username: username.to_string(),
        })
    }

    fn find_user(&self, username: &str) -> Result<Option<User>, StoreError> {
        let user = self
            .conn()
            .prepare_cached("SELECT id, username FROM users WHERE username = ?1")?
            .query_row(params![username], |row| {
                Ok(User {
                    id: UserId(row.get(0)?),
                    username: row.get(1)?,
                })
            })
            .optional()?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, d).unwrap()
    }

    #[test]
    fn test_schema_and_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = store.register_user("alice").unwrap();
        let id = store.write_sample(user.id, 201.5, day(3)).unwrap();

        let sample = store.sample(id).unwrap().unwrap();
        assert_eq!(
            sample,
            WeightSample {
                id,
                user_id: user.id,
                value: 201.5,
                recorded_on: day(3),
            }
        );
    }

    #[test]
    fn test_register_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.register_user("guest").unwrap();
        let second = store.register_user("guest").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.find_user("guest").unwrap(), Some(first));
    }

    #[test]
    fn test_live_queries_follow_mutations() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = store.register_user("alice").unwrap().id;
        let latest = store.latest_sample(user).unwrap();
        let earliest = store.earliest_sample(user).unwrap();

        store.write_sample(user, 200.0, day(1)).unwrap();
        let newest = store.write_sample(user, 190.0, day(9)).unwrap();
        assert_eq!(latest.get().unwrap().value, 190.0);
        assert_eq!(earliest.get().unwrap().value, 200.0);

        store.delete_sample(newest).unwrap();
        assert_eq!(latest.get().unwrap().value, 200.0);
    }

    #[test]
    fn test_same_date_upserts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = store.register_user("alice").unwrap().id;
        let a = store.write_sample(user, 200.0, day(1)).unwrap();
        let b = store.write_sample(user, 199.0, day(1)).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.history(user).unwrap().get().len(), 1);
    }

    #[test]
    fn test_duplicate_date_on_update() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = store.register_user("alice").unwrap().id;
        store.write_sample(user, 200.0, day(1)).unwrap();
        let other = store.write_sample(user, 195.0, day(2)).unwrap();
        assert!(matches!(
            store.update_sample(other, 195.0, day(1)),
            Err(StoreError::DuplicateDate(_))
        ));
        // Failed write leaves the sample untouched
        assert_eq!(store.sample(other).unwrap().unwrap().recorded_on, day(2));
    }

    #[test]
    fn test_goal_upsert_and_update() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = store.register_user("alice").unwrap().id;
        let goal = store.goal(user).unwrap();

        let id = store.write_goal(user, 160.0).unwrap();
        assert_eq!(store.write_goal(user, 158.0).unwrap(), id);
        store.update_goal(id, 150.0).unwrap();
        assert_eq!(goal.get().unwrap().value, 150.0);
        assert!(matches!(
            store.update_goal(GoalId(999), 1.0),
            Err(StoreError::GoalNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_user_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            store.write_sample(UserId(7), 180.0, day(1)),
            Err(StoreError::UserNotFound(_))
        ));
    }

    #[test]
    fn test_failed_requery_rolls_back_write() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = store.register_user("alice").unwrap().id;
        let latest = store.latest_sample(user).unwrap();
        store.write_sample(user, 200.0, day(1)).unwrap();

        // Reloading the user's queries reads goal_weights, so hiding it fails the re-query
        store
            .conn()
            .execute_batch("ALTER TABLE goal_weights RENAME TO goal_weights_hidden")
            .unwrap();
        assert!(store.write_sample(user, 180.0, day(2)).is_err());
        store
            .conn()
            .execute_batch("ALTER TABLE goal_weights_hidden RENAME TO goal_weights")
            .unwrap();

        let rows: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM weights", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(latest.get().unwrap().value, 200.0);
        assert_eq!(store.history(user).unwrap().get().len(), 1);
    }

    #[test]
    fn test_observers_can_read_the_store() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let user = store.register_user("alice").unwrap().id;
        let latest = store.latest_sample(user).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let store = Arc::clone(&store);
            let seen = Arc::clone(&seen);
            latest.subscribe(move |_| {
                let rows = store.history(user).unwrap().get().len();
                seen.lock().unwrap().push(rows);
            })
        };

        let (done, finished) = mpsc::channel();
        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store.write_sample(user, 200.0, day(1)).unwrap();
                store.write_sample(user, 190.0, day(2)).unwrap();
                done.send(()).unwrap();
            })
        };

        assert!(finished.recv_timeout(Duration::from_secs(5)).is_ok());
        writer.join().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_inspect_does_not_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weight.db");

        assert_eq!(SqliteStore::inspect(&path).unwrap(), DatabaseHealth::Missing);
        assert!(!path.exists());

        drop(SqliteStore::open(&path).unwrap());
        assert_eq!(SqliteStore::inspect(&path).unwrap(), DatabaseHealth::Ready);
    }

    #[test]
    fn test_inspect_reports_missing_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT);")
            .unwrap();

        assert_eq!(
            SqliteStore::inspect(&path).unwrap(),
            DatabaseHealth::MissingTables(vec!["weights".to_string(), "goal_weights".to_string()])
        );
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weight.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let user = store.register_user("alice").unwrap().id;
            store.write_sample(user, 180.0, day(4)).unwrap();
            store.write_goal(user, 150.0).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let user = store.find_user("alice").unwrap().unwrap().id;
        assert_eq!(store.latest_sample(user).unwrap().get().unwrap().value, 180.0);
        assert_eq!(store.goal(user).unwrap().get().unwrap().value, 150.0);
    }
}
