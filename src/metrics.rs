//! Derived progress metrics
//!
//! Pure formulas behind the engine's four outputs. Every formula is total:
//! an unknown input yields the documented default of 0 instead of an error.
//!
//! - Total loss: starting - current
//! - Target loss: starting - goal
//! - Remaining loss: target loss - total loss
//! - Loss percent: total loss / target loss * 100, clamped to at most 100

use crate::types::MetricKind;

/// Upper bound for the progress percentage
pub const MAX_LOSS_PERCENT: f64 = 100.0;

/// Weight lost so far. Negative when weight was gained.
pub fn total_loss(starting: Option<f64>, current: Option<f64>) -> f64 {
    match (starting, current) {
        (Some(start), Some(curr)) => start - curr,
        _ => 0.0,
    }
}

/// Weight the user set out to lose
pub fn target_loss(starting: Option<f64>, goal: Option<f64>) -> f64 {
    match (starting, goal) {
        (Some(start), Some(goal)) => start - goal,
        _ => 0.0,
    }
}

/// Weight left to lose. Negative once the user has gone past the goal.
pub fn remaining_loss(target_loss: Option<f64>, total_loss: Option<f64>) -> f64 {
    match (target_loss, total_loss) {
        (Some(target), Some(total)) => target - total,
        _ => 0.0,
    }
}

/// Percentage of the target loss achieved.
///
/// Clamped to 100 on overshoot. There is no lower clamp: gaining weight yields a
/// negative percentage. A zero target (goal equal to starting weight) yields 0.
pub fn loss_percent(starting: Option<f64>, current: Option<f64>, goal: Option<f64>) -> f64 {
    let (Some(start), Some(curr), Some(goal)) = (starting, current, goal) else {
        return 0.0;
    };

    let target = start - goal;
    if target == 0.0 {
        return 0.0;
    }

    let percent = ((start - curr) / target) * 100.0;
    if percent.is_nan() {
        return 0.0;
    }
    percent.min(MAX_LOSS_PERCENT)
}

/// Evaluate `kind` from its upstream values, given in the order declared by
/// [`crate::graph::dependencies`].
pub fn evaluate(kind: MetricKind, upstream: &[Option<f64>]) -> f64 {
    let arg = |i: usize| upstream.get(i).copied().flatten();
    match kind {
        MetricKind::TotalLoss => total_loss(arg(0), arg(1)),
        MetricKind::TargetLoss => target_loss(arg(0), arg(1)),
        MetricKind::RemainingLoss => remaining_loss(arg(0), arg(1)),
        MetricKind::LossPercent => loss_percent(arg(0), arg(1), arg(2)),
    }
}
