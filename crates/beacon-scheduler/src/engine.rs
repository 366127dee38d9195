use std::sync::Arc;

use beacon_core::{
    decrypt_secret_params, BackendConfig, BeaconConfig, BeaconError, DefinitionSource, ErrorKind,
    ExecutionOutcome, ExecutionResult, InstanceId, InstanceStore, InstanceView,
    NotificationPublisher, Result, SecretCodec, UpdateEvent, UpdateType, WidgetInstance,
    WidgetState,
};
use beacon_sandbox::{ScriptContext, ScriptRunner};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::registry::{Epoch, ExecutionRegistry, ExecutionTicket};
use crate::schedule::SchedulePolicy;

/// External capabilities the scheduler drives.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn InstanceStore>,
    pub definitions: Arc<dyn DefinitionSource>,
    pub codec: Arc<dyn SecretCodec>,
    pub runner: Arc<dyn ScriptRunner>,
    pub publisher: Arc<dyn NotificationPublisher>,
}

/// What to do with the recurrence once a tick is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    /// Arm the next tick on the normal interval.
    Rearm,
    /// End the recurrence: FATAL result or instance gone.
    Stop,
    /// A newer intent owns the instance; leave its handle alone.
    Superseded,
}

/// Decides when each widget instance runs and carries each run through to
/// persisted state and viewer notification.
pub struct WidgetScheduler {
    registry: Arc<ExecutionRegistry>,
    deps: Collaborators,
    policy: SchedulePolicy,
}

impl WidgetScheduler {
    pub fn new(deps: Collaborators, config: &BeaconConfig) -> Arc<Self> {
        Self::with_policy(deps, SchedulePolicy::from_config(config))
    }

    pub fn with_policy(deps: Collaborators, policy: SchedulePolicy) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(ExecutionRegistry::new()),
            deps,
            policy,
        })
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    /// Arm the next run of `instance_id` from its configured refresh interval.
    ///
    /// Replaces any pending handle. Returns `false` when the instance does not
    /// exist. A STOPPED instance moves to RUNNING.
    pub fn schedule_widget(self: &Arc<Self>, instance_id: InstanceId) -> Result<bool> {
        self.arm(instance_id, None)
    }

    /// Withdraw the pending or running execution of `instance_id`.
    ///
    /// Waits until an in-flight run has let go of the instance, then marks it
    /// STOPPED. With nothing armed this is a no-op returning `false`.
    pub async fn cancel_widget_execution(&self, instance_id: InstanceId) -> Result<bool> {
        if !self.registry.cancel(instance_id) {
            return Ok(false);
        }
        {
            let _gate = self.registry.acquire(instance_id).await;
            ignore_missing(self.deps.store.update_state(instance_id, WidgetState::Stopped))?;
        }
        self.registry.prune(instance_id);
        info!(instance_id, "widget execution cancelled");
        Ok(true)
    }

    /// Persist data/log/state/last-execution-date of a finished run in one write.
    ///
    /// Returns `false` when the instance has been deleted in the meantime; the
    /// result is dropped silently.
    pub fn record_execution_result(
        &self,
        instance_id: InstanceId,
        result: &ExecutionResult,
    ) -> Result<bool> {
        let outcome = ExecutionOutcome {
            timestamp: result.timestamp(),
            log: result.log(),
            data: result.data(),
            state: result.resulting_state(),
        };
        match self.deps.store.update_execution_outcome(instance_id, &outcome) {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => {
                debug!(instance_id, "late result for deleted instance dropped");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel every armed handle.
    pub fn shutdown(&self) -> usize {
        let n = self.registry.cancel_all();
        info!(cancelled = n, "scheduler stopped");
        n
    }

    fn arm(self: &Arc<Self>, instance_id: InstanceId, expected: Option<Epoch>) -> Result<bool> {
        let Some(instance) = self.deps.store.get(instance_id)? else {
            debug!(instance_id, "not scheduling missing instance");
            return Ok(false);
        };
        let definition = self
            .deps
            .definitions
            .get_definition(instance.widget_id)?
            .ok_or_else(|| BeaconError::not_found("widget", instance.widget_id))?;

        let config = BackendConfig::parse(&instance.backend_config);
        let interval = self.policy.refresh_interval(&definition, &config);
        let delay = self
            .policy
            .next_delay(interval, instance.last_execution_date, Utc::now());

        // Only a fresh schedule moves STOPPED to RUNNING. A re-arm finding
        // STOPPED means the instance was cancelled after its last run.
        if expected.is_none() && instance.state == WidgetState::Stopped {
            self.deps
                .store
                .update_state(instance_id, WidgetState::Running)?;
        }

        let this = Arc::clone(self);
        let job = move |ticket: ExecutionTicket| async move { this.fire(ticket).await };
        let epoch = match expected {
            None => self.registry.schedule(instance_id, delay, job),
            Some(previous) => match self.registry.reschedule(instance_id, previous, delay, job) {
                Some(epoch) => epoch,
                None => {
                    debug!(instance_id, previous, "newer intent armed first; not re-arming");
                    return Ok(false);
                }
            },
        };

        info!(
            instance_id,
            epoch,
            interval_secs = interval.as_secs(),
            delay_ms = delay.as_millis() as u64,
            "widget scheduled"
        );
        Ok(true)
    }

    /// Timer callback. Failures stay confined to this instance.
    async fn fire(self: Arc<Self>, ticket: ExecutionTicket) {
        let instance_id = ticket.instance_id;
        let next = {
            let _gate = self.registry.acquire(instance_id).await;
            match self.tick(&ticket).await {
                Ok(next) => next,
                Err(e) => {
                    warn!(instance_id, epoch = ticket.epoch, error = %e, code = e.code(), "widget tick failed");
                    Next::Rearm
                }
            }
        };

        match next {
            Next::Rearm => match self.arm(instance_id, Some(ticket.epoch)) {
                Ok(true) => {}
                // Instance gone, or superseded (then retire is a no-op).
                Ok(false) => {
                    self.registry.retire(instance_id, ticket.epoch);
                }
                Err(e) => {
                    warn!(instance_id, error = %e, "re-arming widget failed");
                    self.registry.retire(instance_id, ticket.epoch);
                }
            },
            Next::Stop => {
                self.registry.retire(instance_id, ticket.epoch);
                info!(instance_id, "widget recurrence stopped");
            }
            Next::Superseded => {}
        }
    }

    /// One execution, run while holding the instance's gate.
    #[instrument(skip(self, ticket), fields(instance_id = ticket.instance_id, epoch = ticket.epoch))]
    async fn tick(&self, ticket: &ExecutionTicket) -> Result<Next> {
        let instance_id = ticket.instance_id;
        if !self.registry.is_current(instance_id, ticket.epoch) {
            debug!("stale execution skipped");
            return Ok(Next::Superseded);
        }

        // Re-read at fire time: the config may have changed since arming.
        let Some(instance) = self.deps.store.get(instance_id)? else {
            debug!("instance gone before run");
            return Ok(Next::Stop);
        };
        if ignore_missing(
            self.deps
                .store
                .update_state(instance_id, WidgetState::Running),
        )?
        .is_none()
        {
            return Ok(Next::Stop);
        }

        let result = self.execute(&instance, ticket).await?;

        // Checked and written under the slot lock, so a cancel either lands
        // first and the result is dropped, or waits until it is stored.
        let recorded = self.registry.commit_if_current(instance_id, ticket.epoch, || {
            self.record_execution_result(instance_id, &result)
        });
        match recorded {
            None => {
                debug!("stale result dropped");
                return Ok(Next::Superseded);
            }
            Some(stored) => {
                if !stored? {
                    return Ok(Next::Stop);
                }
            }
        }
        match &result {
            ExecutionResult::Success { .. } => debug!("execution succeeded"),
            ExecutionResult::Failure { kind, log, .. } => {
                warn!(kind = ?kind, log = %log, "execution failed")
            }
        }
        self.publish_widget_update(instance_id);

        Ok(if result.is_fatal() { Next::Stop } else { Next::Rearm })
    }

    /// Decrypt, build the script context and run the script.
    async fn execute(
        &self,
        instance: &WidgetInstance,
        ticket: &ExecutionTicket,
    ) -> Result<ExecutionResult> {
        let Some(definition) = self.deps.definitions.get_definition(instance.widget_id)? else {
            return Ok(ExecutionResult::failure(
                ErrorKind::Fatal,
                format!("widget definition {} missing", instance.widget_id),
            ));
        };
        let params = self
            .deps
            .definitions
            .parameters_with_category_defaults(instance.widget_id)?;

        let decrypted = match decrypt_secret_params(
            self.deps.codec.as_ref(),
            &params,
            &instance.backend_config,
        ) {
            Ok(config) => config,
            Err(e) => {
                warn!(instance_id = instance.id, error = %e, "secret parameters could not be decrypted; run skipped");
                return Ok(ExecutionResult::failure(
                    ErrorKind::Continue,
                    format!("cannot decrypt secret parameters: {e}"),
                ));
            }
        };

        let context = ScriptContext::build(instance.id, &params, &decrypted);
        let budget = self.policy.time_budget(&definition);
        Ok(self
            .deps
            .runner
            .execute(&definition.script, &context, budget, &ticket.cancel)
            .await)
    }

    fn publish_widget_update(&self, instance_id: InstanceId) {
        let snapshot = match self.deps.store.get(instance_id) {
            Ok(Some(instance)) => instance,
            Ok(None) => return,
            Err(e) => {
                warn!(instance_id, error = %e, "cannot load instance for update event");
                return;
            }
        };
        let dashboard = match self.deps.store.get_dashboard(snapshot.dashboard_id) {
            Ok(Some(d)) => d,
            Ok(None) => return,
            Err(e) => {
                warn!(instance_id, error = %e, "cannot load dashboard for update event");
                return;
            }
        };
        let content = match serde_json::to_value(InstanceView::from(&snapshot)) {
            Ok(v) => v,
            Err(e) => {
                warn!(instance_id, error = %e, "cannot serialize instance snapshot");
                return;
            }
        };
        self.deps.publisher.publish_to_instance(
            &dashboard.token,
            instance_id,
            UpdateEvent::new(UpdateType::Widget, content),
        );
    }
}

/// Map a NotFound store error to `Ok(None)`.
fn ignore_missing<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
