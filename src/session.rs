//! Tracker session
//!
//! The explicitly constructed store + engine pair owned by whatever drives the
//! UI. Validates user-entered text, forwards edits to the record store, and runs
//! the goal-reached check once per submitted sample.

use chrono::{Local, NaiveDate};
use std::sync::Arc;

use crate::config::TrackerConfig;
use crate::engine::MetricsEngine;
use crate::error::{InputError, SessionError, StoreError};
use crate::store::{RecordStore, SqliteStore};
use crate::types::{GoalId, MetricsSnapshot, SampleId, User, WeightSample};

/// Result of submitting a new sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleOutcome {
    pub id: SampleId,
    /// The submitted weight is at or below the goal
    pub goal_reached: bool,
}

/// Parse an entered weight. Must be a finite, positive number.
pub fn parse_weight(text: &str) -> Result<f64, InputError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(InputError::EmptyWeight);
    }
    let value: f64 = trimmed
        .parse()
        .map_err(|_| InputError::InvalidWeight(trimmed.to_string()))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(InputError::InvalidWeight(trimmed.to_string()));
    }
    Ok(value)
}

/// Parse an entered date with `format`. Missing or blank means today.
pub fn parse_date(text: Option<&str>, format: &str) -> Result<NaiveDate, InputError> {
    match text.map(str::trim).filter(|t| !t.is_empty()) {
        None => Ok(Local::now().date_naive()),
        Some(t) => NaiveDate::parse_from_str(t, format)
            .map_err(|e| InputError::InvalidDate(format!("{}: {}", t, e))),
    }
}

/// Render a weight for display, "N/A" when unknown
pub fn format_weight(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{} {}", v, unit),
        None => "N/A".to_string(),
    }
}

/// Render a loss percentage as whole percent, truncated like a progress label
pub fn format_percent(value: f64) -> String {
    format!("{}%", value.trunc() as i64)
}

pub struct TrackerSession {
    config: TrackerConfig,
    store: Arc<dyn RecordStore>,
    engine: MetricsEngine,
    user: Option<User>,
}

impl std::fmt::Debug for TrackerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerSession")
            .field("user", &self.user)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl TrackerSession {
    /// Open the SQLite database named by `config`
    pub fn open(config: TrackerConfig) -> Result<Self, SessionError> {
        let store = SqliteStore::open(&config.database_path)?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Build a session over an existing store
    pub fn new(store: Arc<dyn RecordStore>, config: TrackerConfig) -> Self {
        let engine = MetricsEngine::new(Arc::clone(&store));
        Self {
            config,
            store,
            engine,
            user: None,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn engine(&self) -> &MetricsEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn active_user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    /// Log in as `username`, registering it on first use, and bind the engine
    pub fn log_in(&mut self, username: &str) -> Result<&User, SessionError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(SessionError::EmptyUsername);
        }

        let user = match self.store.find_user(username)? {
            Some(user) => user,
            None => {
                tracing::info!(username, "registering new user");
                self.store.register_user(username)?
            }
        };

        self.engine.bind(Some(user.id));
        tracing::info!(user = %user.id, username, "logged in");
        Ok(self.user.insert(user))
    }

    /// Log in with the configured guest account
    pub fn log_in_guest(&mut self) -> Result<&User, SessionError> {
        let guest = self.config.guest_username.clone();
        self.log_in(&guest)
    }

    /// Unbind the engine and forget the active user. Idempotent.
    pub fn log_out(&mut self) {
        if let Some(user) = self.user.take() {
            tracing::info!(user = %user.id, "logged out");
        }
        self.engine.unbind();
    }

    fn require_user(&self) -> Result<&User, SessionError> {
        self.user.as_ref().ok_or(SessionError::NotLoggedIn)
    }

    /// Submit a new sample, then run the goal-reached check with its weight
    pub fn add_sample(
        &self,
        weight_text: &str,
        date_text: Option<&str>,
    ) -> Result<SampleOutcome, SessionError> {
        let user = self.require_user()?.id;
        let weight = parse_weight(weight_text)?;
        let date = parse_date(date_text, &self.config.date_format)?;

        let id = self.store.write_sample(user, weight, date)?;
        tracing::info!(user = %user, sample = %id, weight, %date, "added weight");

        let goal_reached = self.engine.check_goal_reached(weight);
        Ok(SampleOutcome { id, goal_reached })
    }

    /// Look up one of the active user's samples, e.g. to prefill an edit form
    pub fn sample(&self, id: SampleId) -> Result<WeightSample, SessionError> {
        let user = self.require_user()?.id;
        match self.store.sample(id)? {
            Some(sample) if sample.user_id == user => Ok(sample),
            _ => Err(StoreError::SampleNotFound(id).into()),
        }
    }

    /// Change a sample. Omitted fields keep their stored value.
    pub fn edit_sample(
        &self,
        id: SampleId,
        weight_text: Option<&str>,
        date_text: Option<&str>,
    ) -> Result<WeightSample, SessionError> {
        let existing = self.sample(id)?;
        let weight = match weight_text {
            Some(text) => parse_weight(text)?,
            None => existing.value,
        };
        let date = match date_text.map(str::trim).filter(|t| !t.is_empty()) {
            Some(text) => parse_date(Some(text), &self.config.date_format)?,
            None => existing.recorded_on,
        };

        self.store.update_sample(id, weight, date)?;
        tracing::info!(sample = %id, weight, %date, "edited weight");
        Ok(WeightSample {
            value: weight,
            recorded_on: date,
            ..existing
        })
    }

    pub fn delete_sample(&self, id: SampleId) -> Result<(), SessionError> {
        self.sample(id)?;
        self.store.delete_sample(id)?;
        tracing::info!(sample = %id, "deleted weight");
        Ok(())
    }

    /// Set the goal weight, changing the existing goal if there is one
    pub fn set_goal(&self, weight_text: &str) -> Result<GoalId, SessionError> {
        let user = self.require_user()?.id;
        let weight = parse_weight(weight_text)?;

        let id = match self.engine.goal_weight().get() {
            Some(goal) if goal.user_id == user => {
                self.store.update_goal(goal.id, weight)?;
                goal.id
            }
            _ => self.store.write_goal(user, weight)?,
        };
        tracing::info!(user = %user, goal = %id, weight, "set goal weight");
        Ok(id)
    }

    /// Every sample of the active user, newest first
    pub fn history(&self) -> Result<Vec<WeightSample>, SessionError> {
        let user = self.require_user()?.id;
        Ok(self.store.history(user)?.get())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.snapshot()
    }
}

impl Drop for TrackerSession {
    fn drop(&mut self) {
        self.engine.unbind();
    }
}
