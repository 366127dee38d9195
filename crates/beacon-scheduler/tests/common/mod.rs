// Shared in-memory collaborators for scheduler tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::{
    merge_parameters, BeaconError, Dashboard, DashboardId, DefinitionSource, ExecutionOutcome,
    ExecutionResult, InstanceId, InstanceStore, NewWidgetInstance, NotificationPublisher,
    Position, Result, SecretCodec, UpdateEvent, WidgetDefinition, WidgetId, WidgetInstance,
    WidgetParam, WidgetState,
};
use beacon_sandbox::{ScriptContext, ScriptRunner};
use beacon_scheduler::{Collaborators, SchedulePolicy, WidgetScheduler};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MemoryStore {
    pub instances: Mutex<HashMap<InstanceId, WidgetInstance>>,
    pub dashboards: Mutex<HashMap<DashboardId, Dashboard>>,
    /// Every state written, in order.
    pub state_log: Mutex<Vec<(InstanceId, WidgetState)>>,
    /// Makes `get` block for a while when the instance is in the given state.
    slow_reads: Mutex<Option<(WidgetState, Duration)>>,
    next_id: AtomicUsize,
}

impl MemoryStore {
    pub fn add_dashboard(&self, id: DashboardId, token: &str) {
        self.dashboards.lock().unwrap().insert(
            id,
            Dashboard {
                id,
                name: format!("dashboard {id}"),
                token: token.to_string(),
            },
        );
    }

    pub fn snapshot(&self, id: InstanceId) -> Option<WidgetInstance> {
        self.instances.lock().unwrap().get(&id).cloned()
    }

    pub fn states_of(&self, id: InstanceId) -> Vec<WidgetState> {
        self.state_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| *i == id)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn set_backend_config(&self, id: InstanceId, config: &str) {
        if let Some(i) = self.instances.lock().unwrap().get_mut(&id) {
            i.backend_config = config.to_string();
        }
    }

    pub fn slow_reads_in(&self, state: WidgetState, delay: Duration) {
        *self.slow_reads.lock().unwrap() = Some((state, delay));
    }

    pub fn remove(&self, id: InstanceId) {
        self.instances.lock().unwrap().remove(&id);
    }
}

impl InstanceStore for MemoryStore {
    fn get(&self, id: InstanceId) -> Result<Option<WidgetInstance>> {
        let found = self.snapshot(id);
        let slow = *self.slow_reads.lock().unwrap();
        if let (Some(instance), Some((state, delay))) = (&found, slow) {
            if instance.state == state {
                std::thread::sleep(delay);
            }
        }
        Ok(found)
    }

    fn insert(&self, new: &NewWidgetInstance) -> Result<WidgetInstance> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as InstanceId + 1;
        let instance = WidgetInstance {
            id,
            dashboard_id: new.dashboard_id,
            widget_id: new.widget_id,
            backend_config: new.backend_config.clone(),
            custom_style: new.custom_style.clone(),
            position: new.position,
            data: None,
            log: None,
            state: WidgetState::Stopped,
            last_execution_date: None,
        };
        self.instances.lock().unwrap().insert(id, instance.clone());
        Ok(instance)
    }

    fn save(&self, instance: &WidgetInstance) -> Result<()> {
        let mut map = self.instances.lock().unwrap();
        let slot = map
            .get_mut(&instance.id)
            .ok_or_else(|| BeaconError::not_found("instance", instance.id))?;
        slot.backend_config = instance.backend_config.clone();
        slot.custom_style = instance.custom_style.clone();
        slot.position = instance.position;
        Ok(())
    }

    fn delete(&self, _dashboard_id: DashboardId, id: InstanceId) -> Result<bool> {
        Ok(self.instances.lock().unwrap().remove(&id).is_some())
    }

    fn update_position(&self, id: InstanceId, position: &Position) -> Result<()> {
        let mut map = self.instances.lock().unwrap();
        let slot = map
            .get_mut(&id)
            .ok_or_else(|| BeaconError::not_found("instance", id))?;
        slot.position = *position;
        Ok(())
    }

    fn update_state(&self, id: InstanceId, state: WidgetState) -> Result<()> {
        let mut map = self.instances.lock().unwrap();
        let slot = map
            .get_mut(&id)
            .ok_or_else(|| BeaconError::not_found("instance", id))?;
        slot.state = state;
        self.state_log.lock().unwrap().push((id, state));
        Ok(())
    }

    fn update_execution_outcome(&self, id: InstanceId, outcome: &ExecutionOutcome<'_>) -> Result<()> {
        let mut map = self.instances.lock().unwrap();
        let slot = map
            .get_mut(&id)
            .ok_or_else(|| BeaconError::not_found("instance", id))?;
        slot.last_execution_date = Some(outcome.timestamp);
        slot.log = Some(outcome.log.to_string());
        if let Some(data) = outcome.data {
            slot.data = Some(data.to_string());
        }
        slot.state = outcome.state;
        self.state_log.lock().unwrap().push((id, outcome.state));
        Ok(())
    }

    fn list_by_dashboard(&self, dashboard_id: DashboardId) -> Result<Vec<WidgetInstance>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.dashboard_id == dashboard_id)
            .cloned()
            .collect())
    }

    fn list_all(&self) -> Result<Vec<WidgetInstance>> {
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }

    fn reset_states(&self) -> Result<usize> {
        let mut map = self.instances.lock().unwrap();
        for i in map.values_mut() {
            i.state = WidgetState::Stopped;
        }
        Ok(map.len())
    }

    fn get_dashboard(&self, id: DashboardId) -> Result<Option<Dashboard>> {
        Ok(self.dashboards.lock().unwrap().get(&id).cloned())
    }
}

#[derive(Default)]
pub struct StaticDefinitions {
    pub widgets: Mutex<HashMap<WidgetId, WidgetDefinition>>,
    pub category_params: Vec<WidgetParam>,
}

impl StaticDefinitions {
    pub fn with(definition: WidgetDefinition) -> Self {
        let defs = Self::default();
        defs.widgets.lock().unwrap().insert(definition.id, definition);
        defs
    }
}

impl DefinitionSource for StaticDefinitions {
    fn get_definition(&self, widget_id: WidgetId) -> Result<Option<WidgetDefinition>> {
        Ok(self.widgets.lock().unwrap().get(&widget_id).cloned())
    }

    fn parameters_with_category_defaults(&self, widget_id: WidgetId) -> Result<Vec<WidgetParam>> {
        let widgets = self.widgets.lock().unwrap();
        let def = widgets
            .get(&widget_id)
            .ok_or_else(|| BeaconError::not_found("widget", widget_id))?;
        Ok(merge_parameters(&def.parameters, &self.category_params))
    }
}

/// Reversible codec: `enc:` + reversed text.
#[derive(Default)]
pub struct PrefixCodec {
    pub decrypts: AtomicUsize,
}

impl SecretCodec for PrefixCodec {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(format!("enc:{}", plaintext.chars().rev().collect::<String>()))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        self.decrypts.fetch_add(1, Ordering::SeqCst);
        ciphertext
            .strip_prefix("enc:")
            .map(|s| s.chars().rev().collect())
            .ok_or_else(|| BeaconError::Codec("malformed ciphertext".into()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Published {
    Dashboard(String, UpdateEvent),
    Instance(String, InstanceId, UpdateEvent),
    AllViewers(DashboardId, UpdateEvent),
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<Published>>,
}

impl RecordingPublisher {
    pub fn instance_events(&self, id: InstanceId) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Published::Instance(_, i, _) if *i == id))
            .count()
    }
}

impl NotificationPublisher for RecordingPublisher {
    fn publish(&self, dashboard_token: &str, event: UpdateEvent) {
        self.events
            .lock()
            .unwrap()
            .push(Published::Dashboard(dashboard_token.to_string(), event));
    }

    fn publish_to_instance(&self, dashboard_token: &str, instance_id: InstanceId, event: UpdateEvent) {
        self.events.lock().unwrap().push(Published::Instance(
            dashboard_token.to_string(),
            instance_id,
            event,
        ));
    }

    fn publish_to_all_viewers(&self, dashboard_id: DashboardId, event: UpdateEvent) {
        self.events
            .lock()
            .unwrap()
            .push(Published::AllViewers(dashboard_id, event));
    }
}

type Respond = Box<dyn Fn(&ScriptContext) -> ExecutionResult + Send + Sync>;

/// Runner that answers from a closure, optionally parked until released.
pub struct ScriptedRunner {
    respond: Respond,
    hold: Option<Arc<Semaphore>>,
    honor_cancel: bool,
    pub contexts: Mutex<Vec<ScriptContext>>,
    /// Runs currently inside `execute`, and the highest value seen.
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new(respond: impl Fn(&ScriptContext) -> ExecutionResult + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            hold: None,
            honor_cancel: true,
            contexts: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Park every run until `release` is called.
    pub fn held(mut self) -> Self {
        self.hold = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Keep running after cancellation, like a misbehaving sandbox.
    pub fn ignoring_cancel(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    pub fn release(&self) {
        if let Some(ref sem) = self.hold {
            sem.add_permits(1_000);
        }
    }

    pub fn calls(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }
}

#[async_trait]
impl ScriptRunner for ScriptedRunner {
    async fn execute(
        &self,
        _script: &str,
        context: &ScriptContext,
        _budget: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        self.contexts.lock().unwrap().push(context.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if let Some(ref sem) = self.hold {
            if self.honor_cancel {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sem.acquire() => {}
                }
            } else {
                let _ = sem.acquire().await;
            }
        }
        let result = (self.respond)(context);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub definitions: Arc<StaticDefinitions>,
    pub codec: Arc<PrefixCodec>,
    pub runner: Arc<ScriptedRunner>,
    pub publisher: Arc<RecordingPublisher>,
    pub scheduler: Arc<WidgetScheduler>,
}

pub fn definition(id: WidgetId, delay_secs: u64, parameters: Vec<WidgetParam>) -> WidgetDefinition {
    WidgetDefinition {
        id,
        technical_name: format!("widget-{id}"),
        category_id: None,
        parameters,
        script: "function run() { return {}; }".to_string(),
        delay_secs: Some(delay_secs),
        timeout_secs: Some(5),
    }
}

pub fn policy() -> SchedulePolicy {
    SchedulePolicy {
        default_interval: Duration::from_secs(60),
        min_interval: Duration::from_millis(1),
        max_jitter: Duration::ZERO,
        default_budget: Duration::from_secs(5),
    }
}

impl Harness {
    pub fn new(definition: WidgetDefinition, runner: ScriptedRunner) -> Self {
        let store = Arc::new(MemoryStore::default());
        store.add_dashboard(1, "dash-token");
        let definitions = Arc::new(StaticDefinitions::with(definition));
        let codec = Arc::new(PrefixCodec::default());
        let runner = Arc::new(runner);
        let publisher = Arc::new(RecordingPublisher::default());
        let scheduler = WidgetScheduler::with_policy(
            Collaborators {
                store: store.clone(),
                definitions: definitions.clone(),
                codec: codec.clone(),
                runner: runner.clone(),
                publisher: publisher.clone(),
            },
            policy(),
        );
        Self {
            store,
            definitions,
            codec,
            runner,
            publisher,
            scheduler,
        }
    }

    pub fn add_instance(&self, widget_id: WidgetId, backend_config: &str) -> InstanceId {
        self.store
            .insert(&NewWidgetInstance {
                dashboard_id: 1,
                widget_id,
                backend_config: backend_config.to_string(),
                ..Default::default()
            })
            .expect("insert")
            .id
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
