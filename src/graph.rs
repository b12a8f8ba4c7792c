//! Dependency graph for derived metrics
//!
//! Each derived metric declares its upstream nodes (engine inputs or other
//! metrics). The graph keeps the last value of every node; changing inputs marks
//! all transitive dependents dirty and recomputes each of them once, upstream
//! before downstream, so no metric is ever evaluated against a stale dependency.

use std::collections::{HashMap, HashSet};

use crate::metrics;
use crate::types::{InputKind, MetricKind};

/// A node of the metrics graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Input(InputKind),
    Metric(MetricKind),
}

/// Upstream nodes of each metric, in the argument order of [`metrics::evaluate`]
pub fn dependencies(kind: MetricKind) -> &'static [Node] {
    use InputKind::*;
    match kind {
        MetricKind::TotalLoss => &[Node::Input(Starting), Node::Input(Current)],
        MetricKind::TargetLoss => &[Node::Input(Starting), Node::Input(Goal)],
        MetricKind::RemainingLoss => &[
            Node::Metric(MetricKind::TargetLoss),
            Node::Metric(MetricKind::TotalLoss),
        ],
        MetricKind::LossPercent => &[
            Node::Input(Starting),
            Node::Input(Current),
            Node::Input(Goal),
        ],
    }
}

/// Order metrics so every metric comes after the metrics it depends on (Kahn's algorithm)
fn topological_order(kinds: &[MetricKind]) -> Vec<MetricKind> {
    let mut pending: HashMap<MetricKind, usize> = kinds
        .iter()
        .map(|&kind| {
            let upstream_metrics = dependencies(kind)
                .iter()
                .filter(|node| matches!(node, Node::Metric(_)))
                .count();
            (kind, upstream_metrics)
        })
        .collect();

    let mut order = Vec::with_capacity(kinds.len());
    // Seed in declaration order so the result is deterministic
    let mut ready: Vec<MetricKind> = kinds
        .iter()
        .copied()
        .filter(|kind| pending[kind] == 0)
        .collect();

    while !ready.is_empty() {
        let kind = ready.remove(0);
        order.push(kind);
        for &downstream in kinds {
            if dependencies(downstream).contains(&Node::Metric(kind)) {
                if let Some(count) = pending.get_mut(&downstream) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(downstream);
                    }
                }
            }
        }
    }

    debug_assert_eq!(order.len(), kinds.len(), "metric dependencies form a cycle");
    order
}

/// Live values of every input and metric node
#[derive(Debug, Clone)]
pub struct MetricGraph {
    inputs: HashMap<InputKind, Option<f64>>,
    metrics: HashMap<MetricKind, f64>,
    order: Vec<MetricKind>,
    dependents: HashMap<Node, Vec<MetricKind>>,
}

impl Default for MetricGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricGraph {
    /// Build the graph with every input unknown and every metric at its default
    pub fn new() -> Self {
        let order = topological_order(&MetricKind::ALL);

        let mut dependents: HashMap<Node, Vec<MetricKind>> = HashMap::new();
        for &kind in &order {
            for &upstream in dependencies(kind) {
                dependents.entry(upstream).or_default().push(kind);
            }
        }

        let mut graph = Self {
            inputs: InputKind::ALL.iter().map(|&k| (k, None)).collect(),
            metrics: HashMap::new(),
            order,
            dependents,
        };
        for kind in graph.order.clone() {
            let value = graph.compute(kind);
            graph.metrics.insert(kind, value);
        }
        graph
    }

    /// Current value of an input (None = unknown)
    pub fn input(&self, kind: InputKind) -> Option<f64> {
        self.inputs.get(&kind).copied().flatten()
    }

    /// Current value of a metric
    pub fn metric(&self, kind: MetricKind) -> f64 {
        self.metrics.get(&kind).copied().unwrap_or(0.0)
    }

    /// Metrics in recomputation order
    pub fn order(&self) -> &[MetricKind] {
        &self.order
    }

    /// Metrics that read `node` directly
    pub fn dependents(&self, node: Node) -> &[MetricKind] {
        self.dependents.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Change one input. See [`MetricGraph::set_inputs`].
    pub fn set_input(&mut self, kind: InputKind, value: Option<f64>) -> Vec<(MetricKind, f64)> {
        self.set_inputs(&[(kind, value)])
    }

    /// Apply several input changes, then recompute affected metrics in one pass.
    ///
    /// Returns the metrics whose value changed, in recomputation order.
    pub fn set_inputs(&mut self, changes: &[(InputKind, Option<f64>)]) -> Vec<(MetricKind, f64)> {
        let mut dirty: HashSet<MetricKind> = HashSet::new();
        for &(kind, value) in changes {
            if self.input(kind) == value {
                continue;
            }
            self.inputs.insert(kind, value);
            self.mark_dirty(Node::Input(kind), &mut dirty);
        }
        self.recompute(&dirty)
    }

    /// Forget every input; metrics fall back to their defaults
    pub fn reset(&mut self) -> Vec<(MetricKind, f64)> {
        let cleared: Vec<(InputKind, Option<f64>)> =
            InputKind::ALL.iter().map(|&k| (k, None)).collect();
        self.set_inputs(&cleared)
    }

    fn mark_dirty(&self, node: Node, dirty: &mut HashSet<MetricKind>) {
        for &kind in self.dependents(node) {
            if dirty.insert(kind) {
                self.mark_dirty(Node::Metric(kind), dirty);
            }
        }
    }

    fn recompute(&mut self, dirty: &HashSet<MetricKind>) -> Vec<(MetricKind, f64)> {
        let mut changed = Vec::new();
        for kind in self.order.clone() {
            if !dirty.contains(&kind) {
                continue;
            }
            let value = self.compute(kind);
            let previous = self.metrics.insert(kind, value);
            if previous != Some(value) {
                changed.push((kind, value));
            }
        }
        changed
    }

    fn compute(&self, kind: MetricKind) -> f64 {
        let upstream: Vec<Option<f64>> = dependencies(kind)
            .iter()
            .map(|node| match node {
                Node::Input(input) => self.input(*input),
                Node::Metric(metric) => self.metrics.get(metric).copied(),
            })
            .collect();
        metrics::evaluate(kind, &upstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn position(order: &[MetricKind], kind: MetricKind) -> usize {
        order.iter().position(|k| *k == kind).unwrap()
    }

    #[test]
    fn test_order_respects_dependencies() {
        let graph = MetricGraph::new();
        let order = graph.order();
        assert_eq!(order.len(), 4);
        assert!(position(order, MetricKind::TotalLoss) < position(order, MetricKind::RemainingLoss));
        assert!(position(order, MetricKind::TargetLoss) < position(order, MetricKind::RemainingLoss));
    }

    #[test]
    fn test_dependents_of_starting_weight() {
        let graph = MetricGraph::new();
        let mut deps = graph.dependents(Node::Input(InputKind::Starting)).to_vec();
        deps.sort_by_key(|k| k.as_str());
        assert_eq!(
            deps,
            vec![MetricKind::LossPercent, MetricKind::TargetLoss, MetricKind::TotalLoss]
        );
        assert_eq!(
            graph.dependents(Node::Metric(MetricKind::TotalLoss)),
            &[MetricKind::RemainingLoss]
        );
        assert!(graph.dependents(Node::Metric(MetricKind::LossPercent)).is_empty());
    }

    #[test]
    fn test_defaults_with_no_inputs() {
        let graph = MetricGraph::new();
        for kind in MetricKind::ALL {
            assert_eq!(graph.metric(kind), 0.0);
        }
    }

    #[test]
    fn test_progress_scenario() {
        let mut graph = MetricGraph::new();
        graph.set_inputs(&[
            (InputKind::Starting, Some(200.0)),
            (InputKind::Current, Some(180.0)),
            (InputKind::Goal, Some(150.0)),
        ]);
        assert_eq!(graph.metric(MetricKind::TotalLoss), 20.0);
        assert_eq!(graph.metric(MetricKind::TargetLoss), 50.0);
        assert_eq!(graph.metric(MetricKind::RemainingLoss), 30.0);
        assert_eq!(graph.metric(MetricKind::LossPercent), 40.0);
    }

    #[test]
    fn test_goal_change_skips_total_loss() {
        let mut graph = MetricGraph::new();
        graph.set_inputs(&[
            (InputKind::Starting, Some(200.0)),
            (InputKind::Current, Some(180.0)),
            (InputKind::Goal, Some(150.0)),
        ]);

        let changed = graph.set_input(InputKind::Goal, Some(160.0));
        let kinds: Vec<MetricKind> = changed.iter().map(|(k, _)| *k).collect();
        assert!(!kinds.contains(&MetricKind::TotalLoss));
        assert!(kinds.contains(&MetricKind::TargetLoss));
        assert!(kinds.contains(&MetricKind::RemainingLoss));
        assert_eq!(graph.metric(MetricKind::RemainingLoss), 20.0);
        assert_eq!(graph.metric(MetricKind::LossPercent), 50.0);
    }

    #[test]
    fn test_unchanged_input_recomputes_nothing() {
        let mut graph = MetricGraph::new();
        graph.set_input(InputKind::Starting, Some(200.0));
        assert!(graph.set_input(InputKind::Starting, Some(200.0)).is_empty());
    }

    #[test]
    fn test_goal_unset_partial_data() {
        let mut graph = MetricGraph::new();
        graph.set_inputs(&[
            (InputKind::Starting, Some(200.0)),
            (InputKind::Current, Some(185.0)),
        ]);
        assert_eq!(graph.metric(MetricKind::TargetLoss), 0.0);
        assert_eq!(graph.metric(MetricKind::LossPercent), 0.0);
        assert_eq!(graph.metric(MetricKind::RemainingLoss), -15.0);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut graph = MetricGraph::new();
        graph.set_inputs(&[
            (InputKind::Starting, Some(200.0)),
            (InputKind::Current, Some(180.0)),
            (InputKind::Goal, Some(150.0)),
        ]);
        let changed = graph.reset();
        assert_eq!(changed.len(), 4);
        for kind in MetricKind::ALL {
            assert_eq!(graph.metric(kind), 0.0);
        }
        assert_eq!(graph.input(InputKind::Goal), None);
    }
}
