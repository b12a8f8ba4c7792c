//! Goal-reached evaluation
//!
//! A discrete check run once per submitted sample, never on metric recomputation.

/// Whether `new_current_weight` meets the goal. Always false without a goal.
pub fn goal_reached(new_current_weight: f64, goal_weight: Option<f64>) -> bool {
    match goal_weight {
        Some(goal) => new_current_weight <= goal,
        None => false,
    }
}
