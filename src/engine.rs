//! Derived metrics engine
//!
//! Binds to one user's live queries in the record store (starting, current and
//! goal weight) and keeps four derived outputs up to date through the
//! [`MetricGraph`]. All input changes pass through one mutex-guarded core, so
//! notifications arriving on several threads are applied one at a time.
//!
//! Each binding gets a new epoch. Store notifications carry the epoch they were
//! subscribed under and are dropped once it is stale, so a recomputation never
//! mixes the inputs of two users.
//!
//! Writers take the writer gate first, then the core lock. The core lock is
//! released before outputs are published while the gate stays held, so
//! publications arrive in the order they were computed. Callbacks run inside
//! that window: they may read the engine (including [`MetricsEngine::snapshot`])
//! and the record store, but must not call [`MetricsEngine::bind`],
//! [`MetricsEngine::unbind`] or write to the store.

use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use uuid::Uuid;

use crate::error::StoreError;
use crate::goal;
use crate::graph::MetricGraph;
use crate::observable::{EventSignal, Observable, Subscription};
use crate::store::RecordStore;
use crate::types::{GoalWeight, InputKind, MetricKind, MetricsSnapshot, UserId, WeightSample};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A new value for one engine input
#[derive(Debug, Clone, PartialEq)]
enum InputUpdate {
    Starting(Option<WeightSample>),
    Current(Option<WeightSample>),
    Goal(Option<GoalWeight>),
}

impl InputUpdate {
    fn cleared() -> [InputUpdate; 3] {
        [
            InputUpdate::Starting(None),
            InputUpdate::Current(None),
            InputUpdate::Goal(None),
        ]
    }

    fn kind(&self) -> InputKind {
        match self {
            InputUpdate::Starting(_) => InputKind::Starting,
            InputUpdate::Current(_) => InputKind::Current,
            InputUpdate::Goal(_) => InputKind::Goal,
        }
    }

    fn value(&self) -> Option<f64> {
        match self {
            InputUpdate::Starting(s) | InputUpdate::Current(s) => s.as_ref().map(|s| s.value),
            InputUpdate::Goal(g) => g.as_ref().map(|g| g.value),
        }
    }
}

/// Changes computed under the core lock, waiting to be published
#[derive(Debug, Default)]
struct Pending {
    inputs: Vec<InputUpdate>,
    metrics: Vec<(MetricKind, f64)>,
}

/// Observable handles handed to presentation layers
#[derive(Debug, Clone)]
struct Outputs {
    starting: Observable<Option<WeightSample>>,
    current: Observable<Option<WeightSample>>,
    goal: Observable<Option<GoalWeight>>,
    total_loss: Observable<f64>,
    target_loss: Observable<f64>,
    remaining_loss: Observable<f64>,
    loss_percent: Observable<f64>,
}

impl Outputs {
    fn new() -> Self {
        Self {
            starting: Observable::new(None),
            current: Observable::new(None),
            goal: Observable::new(None),
            total_loss: Observable::new(0.0),
            target_loss: Observable::new(0.0),
            remaining_loss: Observable::new(0.0),
            loss_percent: Observable::new(0.0),
        }
    }

    fn metric(&self, kind: MetricKind) -> &Observable<f64> {
        match kind {
            MetricKind::TotalLoss => &self.total_loss,
            MetricKind::TargetLoss => &self.target_loss,
            MetricKind::RemainingLoss => &self.remaining_loss,
            MetricKind::LossPercent => &self.loss_percent,
        }
    }

    fn publish(&self, pending: Pending) {
        for update in pending.inputs {
            match update {
                InputUpdate::Starting(s) => self.starting.set(s),
                InputUpdate::Current(s) => self.current.set(s),
                InputUpdate::Goal(g) => self.goal.set(g),
            };
        }
        for (kind, value) in pending.metrics {
            self.metric(kind).set(value);
        }
    }
}

/// State mutated by the single writer
struct EngineCore {
    epoch: u64,
    user: Option<UserId>,
    graph: MetricGraph,
    inputs: [Option<InputUpdate>; 3],
    subscriptions: Vec<Subscription>,
}

impl EngineCore {
    fn new() -> Self {
        Self {
            epoch: 0,
            user: None,
            graph: MetricGraph::new(),
            inputs: [None, None, None],
            subscriptions: Vec::new(),
        }
    }

    fn slot(kind: InputKind) -> usize {
        match kind {
            InputKind::Starting => 0,
            InputKind::Current => 1,
            InputKind::Goal => 2,
        }
    }

    /// Apply input updates and recompute every affected metric once
    fn apply(&mut self, updates: Vec<InputUpdate>) -> Pending {
        let changes: Vec<(InputKind, Option<f64>)> =
            updates.iter().map(|u| (u.kind(), u.value())).collect();
        let metrics = self.graph.set_inputs(&changes);

        let mut inputs = Vec::new();
        for update in updates {
            let slot = &mut self.inputs[Self::slot(update.kind())];
            if slot.as_ref() != Some(&update) {
                *slot = Some(update.clone());
                inputs.push(update);
            }
        }

        if !metrics.is_empty() {
            tracing::debug!(
                epoch = self.epoch,
                recomputed = ?metrics.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
                "recomputed metrics"
            );
        }
        Pending { inputs, metrics }
    }
}

/// Live store queries for one user
struct BoundQueries {
    starting: Observable<Option<WeightSample>>,
    current: Observable<Option<WeightSample>>,
    goal: Observable<Option<GoalWeight>>,
}

/// Reactive engine computing weight-loss progress for the bound user
pub struct MetricsEngine {
    id: Uuid,
    store: Arc<dyn RecordStore>,
    core: Arc<Mutex<EngineCore>>,
    writer: Arc<Mutex<()>>,
    outputs: Outputs,
    goal_reached: EventSignal<bool>,
}

impl std::fmt::Debug for MetricsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsEngine")
            .field("id", &self.id)
            .field("user", &self.user())
            .finish_non_exhaustive()
    }
}

impl MetricsEngine {
    /// Create an unbound engine reading from `store`
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            id: Uuid::new_v4(),
            store,
            core: Arc::new(Mutex::new(EngineCore::new())),
            writer: Arc::new(Mutex::new(())),
            outputs: Outputs::new(),
            goal_reached: EventSignal::new(),
        }
    }

    /// Instance identifier, included in log events
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// User the engine is currently bound to
    pub fn user(&self) -> Option<UserId> {
        lock(&self.core).user
    }

    /// Switch the engine's inputs to `user`'s data, or to nothing.
    ///
    /// Runs in two phases under the writer gate. The first detaches from the
    /// previous user and publishes the cleared inputs while [`MetricsEngine::user`]
    /// reports no user. The second sets the new user and seeds its values, so
    /// observers never see one user's data under another's id.
    /// If the store cannot serve the user's queries the inputs stay unknown.
    pub fn bind(&self, user: Option<UserId>) {
        // Fetch before locking the core: the store may be publishing into us
        let queries = user.map(|user| (user, self.fetch_queries(user)));

        let _writer = lock(&self.writer);

        let mut core = lock(&self.core);
        core.epoch += 1;
        let epoch = core.epoch;
        core.subscriptions.clear();
        core.user = None;
        let cleared = core.apply(InputUpdate::cleared().to_vec());
        drop(core);
        self.outputs.publish(cleared);

        let Some((user, queries)) = queries else {
            tracing::info!(engine = %self.id, epoch, "engine unbound");
            return;
        };

        let mut core = lock(&self.core);
        core.user = Some(user);
        let seeded = match queries {
            Err(e) => {
                tracing::warn!(engine = %self.id, user = %user, error = %e, "failed to bind user; inputs stay unknown");
                return;
            }
            Ok(queries) => {
                core.subscriptions = self.subscribe(&queries, epoch);
                // Seed after subscribing so no change can slip between the two
                core.apply(vec![
                    InputUpdate::Starting(queries.starting.get()),
                    InputUpdate::Current(queries.current.get()),
                    InputUpdate::Goal(queries.goal.get()),
                ])
            }
        };
        drop(core);
        self.outputs.publish(seeded);
        tracing::info!(engine = %self.id, user = %user, epoch, "engine bound");
    }

    /// Detach from the current user. Idempotent.
    pub fn unbind(&self) {
        self.bind(None);
    }

    fn fetch_queries(&self, user: UserId) -> Result<BoundQueries, StoreError> {
        Ok(BoundQueries {
            starting: self.store.earliest_sample(user)?,
            current: self.store.latest_sample(user)?,
            goal: self.store.goal(user)?,
        })
    }

    fn subscribe(&self, queries: &BoundQueries, epoch: u64) -> Vec<Subscription> {
        vec![
            queries.starting.subscribe(self.forwarder(epoch, |s: &Option<WeightSample>| {
                InputUpdate::Starting(s.clone())
            })),
            queries.current.subscribe(self.forwarder(epoch, |s: &Option<WeightSample>| {
                InputUpdate::Current(s.clone())
            })),
            queries.goal.subscribe(self.forwarder(epoch, |g: &Option<GoalWeight>| {
                InputUpdate::Goal(g.clone())
            })),
        ]
    }

    /// Callback that routes a store notification into the core
    fn forwarder<T: 'static>(
        &self,
        epoch: u64,
        to_update: impl Fn(&T) -> InputUpdate + Send + Sync + 'static,
    ) -> impl Fn(&T) + Send + Sync + 'static {
        let core: Weak<Mutex<EngineCore>> = Arc::downgrade(&self.core);
        let writer = Arc::clone(&self.writer);
        let outputs = self.outputs.clone();
        let engine = self.id;

        move |value: &T| {
            let Some(core) = core.upgrade() else {
                return;
            };
            let _writer = lock(&writer);
            let mut core = lock(&core);
            if core.epoch != epoch {
                tracing::debug!(engine = %engine, stale = epoch, current = core.epoch, "dropping stale store notification");
                return;
            }
            let pending = core.apply(vec![to_update(value)]);
            drop(core);
            outputs.publish(pending);
        }
    }

    /// Evaluate a newly submitted weight against the goal and fire
    /// [`MetricsEngine::goal_reached`] with the result.
    pub fn check_goal_reached(&self, new_current_weight: f64) -> bool {
        let goal_weight = self.outputs.goal.with(|g| g.as_ref().map(|g| g.value));
        let reached = goal::goal_reached(new_current_weight, goal_weight);
        tracing::info!(engine = %self.id, weight = new_current_weight, goal = ?goal_weight, reached, "checked goal");
        self.goal_reached.fire(reached);
        reached
    }

    /// Single-fire goal-reached events
    pub fn goal_reached(&self) -> &EventSignal<bool> {
        &self.goal_reached
    }

    /// Earliest sample of the bound user
    pub fn starting_weight(&self) -> &Observable<Option<WeightSample>> {
        &self.outputs.starting
    }

    /// Latest sample of the bound user
    pub fn current_weight(&self) -> &Observable<Option<WeightSample>> {
        &self.outputs.current
    }

    pub fn goal_weight(&self) -> &Observable<Option<GoalWeight>> {
        &self.outputs.goal
    }

    pub fn total_loss(&self) -> &Observable<f64> {
        &self.outputs.total_loss
    }

    pub fn target_loss(&self) -> &Observable<f64> {
        &self.outputs.target_loss
    }

    pub fn remaining_loss(&self) -> &Observable<f64> {
        &self.outputs.remaining_loss
    }

    pub fn loss_percent(&self) -> &Observable<f64> {
        &self.outputs.loss_percent
    }

    /// Observable for any metric
    pub fn metric(&self, kind: MetricKind) -> &Observable<f64> {
        self.outputs.metric(kind)
    }

    /// Whether an input currently has a value (false renders as "N/A")
    pub fn is_known(&self, kind: InputKind) -> bool {
        lock(&self.core).graph.input(kind).is_some()
    }

    /// Every input and output, read from one consistent core state
    pub fn snapshot(&self) -> MetricsSnapshot {
        let core = lock(&self.core);
        let starting_date = match &core.inputs[EngineCore::slot(InputKind::Starting)] {
            Some(InputUpdate::Starting(Some(sample))) => Some(sample.recorded_on),
            _ => None,
        };

        MetricsSnapshot {
            user_id: core.user,
            starting_weight: core.graph.input(InputKind::Starting),
            starting_date,
            current_weight: core.graph.input(InputKind::Current),
            goal_weight: core.graph.input(InputKind::Goal),
            loss_percent: core.graph.metric(MetricKind::LossPercent),
            total_loss: core.graph.metric(MetricKind::TotalLoss),
            target_loss: core.graph.metric(MetricKind::TargetLoss),
            remaining_loss: core.graph.metric(MetricKind::RemainingLoss),
            taken_at: Utc::now(),
        }
    }
}

impl Drop for MetricsEngine {
    fn drop(&mut self) {
        lock(&self.core).subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn setup() -> (Arc<MemoryStore>, MetricsEngine, UserId) {
        let store = Arc::new(MemoryStore::new());
        let user = store.register_user("alice").unwrap().id;
        let engine = MetricsEngine::new(store.clone());
        (store, engine, user)
    }

    fn metrics(engine: &MetricsEngine) -> [f64; 4] {
        [
            engine.total_loss().get(),
            engine.target_loss().get(),
            engine.remaining_loss().get(),
            engine.loss_percent().get(),
        ]
    }

    #[test]
    fn test_progress_scenario() {
        let (store, engine, user) = setup();
        engine.bind(Some(user));
        store.write_sample(user, 200.0, day(1)).unwrap();
        store.write_sample(user, 180.0, day(15)).unwrap();
        store.write_goal(user, 150.0).unwrap();

        assert_eq!(metrics(&engine), [20.0, 50.0, 30.0, 40.0]);
    }

    #[test]
    fn test_overshoot_scenario() {
        let (store, engine, user) = setup();
        engine.bind(Some(user));
        store.write_goal(user, 150.0).unwrap();
        store.write_sample(user, 200.0, day(1)).unwrap();
        store.write_sample(user, 140.0, day(30)).unwrap();

        assert_eq!(metrics(&engine), [60.0, 50.0, -10.0, 100.0]);
        assert!(engine.check_goal_reached(140.0));
    }

    #[test]
    fn test_no_samples_scenario() {
        let (store, engine, user) = setup();
        engine.bind(Some(user));
        store.write_goal(user, 150.0).unwrap();

        assert_eq!(metrics(&engine), [0.0, 0.0, 0.0, 0.0]);
        assert!(!engine.check_goal_reached(160.0));
        assert!(engine.is_known(InputKind::Goal));
        assert!(!engine.is_known(InputKind::Starting));
    }

    #[test]
    fn test_bind_seeds_existing_data() {
        let (store, engine, user) = setup();
        store.write_sample(user, 200.0, day(1)).unwrap();
        store.write_sample(user, 190.0, day(2)).unwrap();

        engine.bind(Some(user));
        assert_eq!(engine.total_loss().get(), 10.0);
        assert_eq!(engine.current_weight().get().unwrap().value, 190.0);
    }

    #[test]
    fn test_goal_unset_partial_data() {
        let (store, engine, user) = setup();
        engine.bind(Some(user));
        store.write_sample(user, 200.0, day(1)).unwrap();
        store.write_sample(user, 188.0, day(2)).unwrap();

        assert_eq!(metrics(&engine), [12.0, 0.0, -12.0, 0.0]);
    }

    #[test]
    fn test_delete_recomputes() {
        let (store, engine, user) = setup();
        engine.bind(Some(user));
        store.write_goal(user, 150.0).unwrap();
        store.write_sample(user, 200.0, day(1)).unwrap();
        let latest = store.write_sample(user, 180.0, day(2)).unwrap();

        store.delete_sample(latest).unwrap();
        assert_eq!(metrics(&engine), [0.0, 50.0, 50.0, 0.0]);
    }

    #[test]
    fn test_user_switch_resets_inputs() {
        let (store, engine, alice) = setup();
        let bob = store.register_user("bob").unwrap().id;
        store.write_sample(alice, 200.0, day(1)).unwrap();
        store.write_sample(alice, 180.0, day(2)).unwrap();
        store.write_goal(bob, 120.0).unwrap();

        engine.bind(Some(alice));
        assert_eq!(engine.total_loss().get(), 20.0);

        engine.bind(Some(bob));
        assert_eq!(engine.user(), Some(bob));
        assert_eq!(metrics(&engine), [0.0, 0.0, 0.0, 0.0]);
        assert!(engine.starting_weight().get().is_none());
        assert_eq!(engine.goal_weight().get().unwrap().value, 120.0);

        // Alice's later writes no longer reach the engine
        store.write_sample(alice, 170.0, day(3)).unwrap();
        assert!(engine.current_weight().get().is_none());
    }

    #[test]
    fn test_user_id_follows_cleared_outputs() {
        let (store, engine, alice) = setup();
        let bob = store.register_user("bob").unwrap().id;
        store.write_sample(alice, 200.0, day(1)).unwrap();
        store.write_sample(alice, 180.0, day(2)).unwrap();
        store.write_sample(bob, 250.0, day(1)).unwrap();
        let engine = Arc::new(engine);
        engine.bind(Some(alice));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let weak = Arc::downgrade(&engine);
            let seen = Arc::clone(&seen);
            engine.starting_weight().subscribe(move |_| {
                if let Some(engine) = weak.upgrade() {
                    seen.lock().unwrap().push((
                        engine.user(),
                        engine.current_weight().get().map(|s| s.value),
                        engine.total_loss().get(),
                    ));
                }
            })
        };

        engine.bind(Some(bob));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(None, Some(180.0), 20.0), (Some(bob), None, 0.0)]);
        // No observation pairs bob's id with alice's values
        assert!(seen
            .iter()
            .filter(|(user, _, _)| *user == Some(bob))
            .all(|(_, current, loss)| current.map_or(true, |c| c == 250.0) && *loss == 0.0));
    }

    #[test]
    fn test_output_callbacks_can_read_the_store() {
        let (store, engine, user) = setup();
        engine.bind(Some(user));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let store = Arc::clone(&store);
            let seen = Arc::clone(&seen);
            engine.current_weight().subscribe(move |_| {
                let rows = store.history(user).unwrap().get().len();
                seen.lock().unwrap().push(rows);
            })
        };

        let (done, finished) = std::sync::mpsc::channel();
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                store.write_sample(user, 200.0, day(1)).unwrap();
                store.write_sample(user, 190.0, day(2)).unwrap();
                done.send(()).unwrap();
            })
        };

        assert!(finished
            .recv_timeout(std::time::Duration::from_secs(5))
            .is_ok());
        writer.join().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(engine.total_loss().get(), 10.0);
    }

    #[test]
    fn test_unbind_is_idempotent() {
        let (store, engine, user) = setup();
        store.write_sample(user, 200.0, day(1)).unwrap();
        engine.bind(Some(user));

        engine.unbind();
        engine.unbind();
        assert_eq!(engine.user(), None);
        assert!(engine.current_weight().get().is_none());
        assert_eq!(store.latest_sample(user).unwrap().subscriber_count(), 0);
    }

    #[test]
    fn test_outputs_notify_per_change() {
        let (store, engine, user) = setup();
        engine.bind(Some(user));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = engine.loss_percent().subscribe(move |v| sink.lock().unwrap().push(*v));

        store.write_goal(user, 150.0).unwrap();
        store.write_sample(user, 200.0, day(1)).unwrap();
        store.write_sample(user, 175.0, day(2)).unwrap();
        // Rewriting the same value publishes nothing
        store.write_sample(user, 175.0, day(2)).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![50.0]);
    }

    #[test]
    fn test_snapshot_from_callback() {
        let (store, engine, user) = setup();
        let engine = Arc::new(engine);
        engine.bind(Some(user));

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let reader = Arc::downgrade(&engine);
        let _sub = engine.total_loss().subscribe(move |_| {
            if let Some(engine) = reader.upgrade() {
                *sink.lock().unwrap() = Some(engine.snapshot().total_loss);
            }
        });

        store.write_sample(user, 200.0, day(1)).unwrap();
        store.write_sample(user, 195.0, day(2)).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(5.0));
    }

    #[test]
    fn test_goal_reached_signal_fires_once_per_check() {
        let (store, engine, user) = setup();
        engine.bind(Some(user));
        store.write_goal(user, 150.0).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = engine.goal_reached().subscribe(move |r| sink.lock().unwrap().push(*r));

        store.write_sample(user, 149.0, day(1)).unwrap();
        assert!(events.lock().unwrap().is_empty());

        engine.check_goal_reached(149.0);
        engine.check_goal_reached(151.0);
        assert_eq!(*events.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_snapshot_contents() {
        let (store, engine, user) = setup();
        engine.bind(Some(user));
        store.write_sample(user, 200.0, day(1)).unwrap();
        store.write_sample(user, 180.0, day(9)).unwrap();
        store.write_goal(user, 150.0).unwrap();

        let snap = engine.snapshot();
        assert_eq!(snap.user_id, Some(user));
        assert_eq!(snap.starting_weight, Some(200.0));
        assert_eq!(snap.starting_date, Some(day(1)));
        assert_eq!(snap.current_weight, Some(180.0));
        assert_eq!(snap.goal_weight, Some(150.0));
        assert_eq!(snap.loss_percent, 40.0);
        assert_eq!(snap.remaining_loss, 30.0);
    }
}
