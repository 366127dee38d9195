use std::sync::Arc;

use beacon_core::{
    decrypt_secret_params, encrypt_secret_params, BeaconError, DashboardId, DashboardSnapshot,
    DefinitionSource, ExecutionResult, InstanceId, InstanceStore, InstanceView, NewWidgetInstance,
    NotificationPublisher, Position, Result, SecretCodec, UpdateEvent, UpdateType, WidgetInstance,
};
use beacon_scheduler::{Collaborators, WidgetScheduler};
use serde_json::json;
use tracing::{info, instrument, warn};

/// Creates, edits and removes widget instances and keeps the scheduler and
/// live viewers in step with every change.
pub struct WidgetCoordinator {
    store: Arc<dyn InstanceStore>,
    definitions: Arc<dyn DefinitionSource>,
    codec: Arc<dyn SecretCodec>,
    publisher: Arc<dyn NotificationPublisher>,
    scheduler: Arc<WidgetScheduler>,
}

impl WidgetCoordinator {
    pub fn new(deps: &Collaborators, scheduler: Arc<WidgetScheduler>) -> Self {
        Self {
            store: Arc::clone(&deps.store),
            definitions: Arc::clone(&deps.definitions),
            codec: Arc::clone(&deps.codec),
            publisher: Arc::clone(&deps.publisher),
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &Arc<WidgetScheduler> {
        &self.scheduler
    }

    /// Put every instance back to STOPPED and arm all of them.
    ///
    /// One instance failing to schedule does not keep the others from
    /// starting. Returns how many were armed.
    pub fn start(&self) -> Result<usize> {
        let reset = self.store.reset_states()?;
        let mut armed = 0;
        for instance in self.store.list_all()? {
            match self.scheduler.schedule_widget(instance.id) {
                Ok(true) => armed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(instance_id = instance.id, error = %e, "could not schedule widget at startup")
                }
            }
        }
        info!(reset, armed, "widget scheduling restored");
        Ok(armed)
    }

    pub fn shutdown(&self) -> usize {
        self.scheduler.shutdown()
    }

    /// Persist a new instance with its secrets encrypted, arm it, and tell
    /// the dashboard's viewers the grid changed.
    ///
    /// A scheduling failure is logged, not returned: the instance is already
    /// stored and stays STOPPED.
    #[instrument(skip(self, new), fields(dashboard_id = new.dashboard_id, widget_id = new.widget_id))]
    pub fn add_instance(&self, new: NewWidgetInstance) -> Result<WidgetInstance> {
        let dashboard = self
            .store
            .get_dashboard(new.dashboard_id)?
            .ok_or_else(|| BeaconError::not_found("dashboard", new.dashboard_id))?;
        let params = self
            .definitions
            .parameters_with_category_defaults(new.widget_id)?;

        let backend_config =
            encrypt_secret_params(self.codec.as_ref(), &params, &new.backend_config)?;
        let created = self.store.insert(&NewWidgetInstance {
            backend_config,
            ..new
        })?;
        // The row exists now; viewers must see it even if it cannot be armed.
        if let Err(e) = self.scheduler.schedule_widget(created.id) {
            warn!(instance_id = created.id, error = %e, code = e.code(), "widget instance stored but not scheduled");
        }
        info!(instance_id = created.id, "widget instance added");

        self.publish_grid(dashboard.id, &dashboard.token, false);
        Ok(self.store.get(created.id)?.unwrap_or(created))
    }

    /// Apply a style and/or config change.
    ///
    /// Any pending or running execution is withdrawn before anything is
    /// written, so a run started against the old config can never land on
    /// top of the new one.
    #[instrument(skip(self, custom_style, backend_config))]
    pub async fn update_instance(
        &self,
        instance_id: InstanceId,
        custom_style: Option<String>,
        backend_config: Option<String>,
    ) -> Result<WidgetInstance> {
        if self.store.get(instance_id)?.is_none() {
            return Err(BeaconError::not_found("instance", instance_id));
        }
        self.scheduler.cancel_widget_execution(instance_id).await?;

        // Re-read after cancelling: the state is STOPPED now.
        let mut instance = self
            .store
            .get(instance_id)?
            .ok_or_else(|| BeaconError::not_found("instance", instance_id))?;
        if let Some(style) = custom_style {
            instance.custom_style = Some(style);
        }
        if let Some(config) = backend_config {
            let params = self
                .definitions
                .parameters_with_category_defaults(instance.widget_id)?;
            instance.backend_config = encrypt_secret_params(self.codec.as_ref(), &params, &config)?;
        }
        self.store.save(&instance)?;
        self.scheduler.schedule_widget(instance_id)?;
        info!(instance_id, "widget instance updated");

        let updated = self.store.get(instance_id)?.unwrap_or(instance);
        if let Some(dashboard) = self.store.get_dashboard(updated.dashboard_id)? {
            match serde_json::to_value(InstanceView::from(&updated)) {
                Ok(content) => self.publisher.publish_to_instance(
                    &dashboard.token,
                    instance_id,
                    UpdateEvent::new(UpdateType::Widget, content),
                ),
                Err(e) => warn!(instance_id, error = %e, "cannot serialize instance snapshot"),
            }
        }
        Ok(updated)
    }

    /// Store new grid placements, then notify once for the whole batch.
    #[instrument(skip(self, positions), fields(count = positions.len()))]
    pub fn update_positions(
        &self,
        dashboard_id: DashboardId,
        positions: &[(InstanceId, Position)],
    ) -> Result<()> {
        let dashboard = self
            .store
            .get_dashboard(dashboard_id)?
            .ok_or_else(|| BeaconError::not_found("dashboard", dashboard_id))?;
        for (instance_id, position) in positions {
            self.store.update_position(*instance_id, position)?;
        }
        let content = json!(positions
            .iter()
            .map(|(id, position)| json!({ "id": id, "position": position }))
            .collect::<Vec<_>>());
        self.publisher
            .publish(&dashboard.token, UpdateEvent::new(UpdateType::Position, content));
        Ok(())
    }

    /// Stop, delete and announce the removal to every viewer of the
    /// dashboard. Returns `false` when the instance did not exist.
    #[instrument(skip(self))]
    pub async fn remove_instance(&self, instance_id: InstanceId) -> Result<bool> {
        let Some(instance) = self.store.get(instance_id)? else {
            return Ok(false);
        };
        self.scheduler.cancel_widget_execution(instance_id).await?;
        if !self.store.delete(instance.dashboard_id, instance_id)? {
            return Ok(false);
        }
        info!(instance_id, "widget instance removed");

        if let Some(dashboard) = self.store.get_dashboard(instance.dashboard_id)? {
            self.publish_grid(dashboard.id, &dashboard.token, true);
        }
        Ok(true)
    }

    /// Persist a finished run. Late results for deleted instances are dropped.
    pub fn record_execution_result(
        &self,
        instance_id: InstanceId,
        result: &ExecutionResult,
    ) -> Result<bool> {
        self.scheduler.record_execution_result(instance_id, result)
    }

    /// Backend config text with PASSWORD values in clear, for an editor.
    pub fn decrypted_backend_config(&self, instance_id: InstanceId) -> Result<String> {
        let instance = self
            .store
            .get(instance_id)?
            .ok_or_else(|| BeaconError::not_found("instance", instance_id))?;
        let params = self
            .definitions
            .parameters_with_category_defaults(instance.widget_id)?;
        let config = decrypt_secret_params(self.codec.as_ref(), &params, &instance.backend_config)?;
        Ok(config.to_text())
    }

    pub fn dashboard_snapshot(&self, dashboard_id: DashboardId) -> Result<DashboardSnapshot> {
        let dashboard = self
            .store
            .get_dashboard(dashboard_id)?
            .ok_or_else(|| BeaconError::not_found("dashboard", dashboard_id))?;
        let instances = self.store.list_by_dashboard(dashboard_id)?;
        Ok(DashboardSnapshot::new(&dashboard, &instances))
    }

    fn publish_grid(&self, dashboard_id: DashboardId, token: &str, all_viewers: bool) {
        let content = match self
            .dashboard_snapshot(dashboard_id)
            .and_then(|s| serde_json::to_value(s).map_err(BeaconError::from))
        {
            Ok(content) => content,
            Err(e) => {
                warn!(dashboard_id, error = %e, "cannot build dashboard snapshot");
                return;
            }
        };
        let event = UpdateEvent::new(UpdateType::Grid, content);
        if all_viewers {
            self.publisher.publish(token, event.clone());
            self.publisher.publish_to_all_viewers(dashboard_id, event);
        } else {
            self.publisher.publish(token, event);
        }
    }
}
