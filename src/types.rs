//! Core types for the weight tracker
//!
//! This module defines the records read from the store (users, weight samples,
//! goal weights), the identifiers of the engine's input and derived nodes, and
//! the snapshot handed to presentation layers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

id_type!(
    /// Identifier of a registered user
    UserId
);
id_type!(
    /// Identifier of a stored weight sample
    SampleId
);
id_type!(
    /// Identifier of a stored goal weight
    GoalId
);

/// A registered user. Identity only, no credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

/// A dated body-weight sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSample {
    pub id: SampleId,
    pub user_id: UserId,
    /// Weight in the user's unit (typically pounds)
    pub value: f64,
    /// Calendar date the sample was recorded on
    pub recorded_on: NaiveDate,
}

/// The user's target weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalWeight {
    pub id: GoalId,
    pub user_id: UserId,
    pub value: f64,
}

/// The three live inputs of the metrics engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Earliest recorded sample
    Starting,
    /// Most recently recorded sample
    Current,
    /// Declared goal weight
    Goal,
}

impl InputKind {
    pub const ALL: [InputKind; 3] = [InputKind::Starting, InputKind::Current, InputKind::Goal];

    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::Starting => "starting",
            InputKind::Current => "current",
            InputKind::Goal => "goal",
        }
    }
}

/// The four derived metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    TotalLoss,
    TargetLoss,
    RemainingLoss,
    LossPercent,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::TotalLoss,
        MetricKind::TargetLoss,
        MetricKind::RemainingLoss,
        MetricKind::LossPercent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::TotalLoss => "total_loss",
            MetricKind::TargetLoss => "target_loss",
            MetricKind::RemainingLoss => "remaining_loss",
            MetricKind::LossPercent => "loss_percent",
        }
    }
}

/// Point-in-time view of every engine input and output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// User the engine is bound to, if any
    pub user_id: Option<UserId>,
    /// Earliest sample value (None renders as "N/A")
    pub starting_weight: Option<f64>,
    /// Date of the earliest sample
    pub starting_date: Option<NaiveDate>,
    /// Latest sample value
    pub current_weight: Option<f64>,
    /// Goal weight value
    pub goal_weight: Option<f64>,
    /// Progress towards the goal, clamped to at most 100
    pub loss_percent: f64,
    /// starting - current
    pub total_loss: f64,
    /// starting - goal
    pub target_loss: f64,
    /// target_loss - total_loss
    pub remaining_loss: f64,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}
