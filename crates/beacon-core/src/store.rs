use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Dashboard, DashboardId, InstanceId, NewWidgetInstance, Position, WidgetDefinition, WidgetId,
    WidgetInstance, WidgetParam, WidgetState,
};

/// Fields written together when an execution result is recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome<'a> {
    pub timestamp: DateTime<Utc>,
    pub log: &'a str,
    /// `None` keeps the previously stored data (failed runs).
    pub data: Option<&'a str>,
    pub state: WidgetState,
}

/// Durable record of widget instances; the single source of truth.
///
/// Lookups return `Ok(None)` for a missing record. Targeted updates on a
/// missing record return [`crate::BeaconError::NotFound`].
pub trait InstanceStore: Send + Sync {
    fn get(&self, id: InstanceId) -> Result<Option<WidgetInstance>>;

    fn insert(&self, instance: &NewWidgetInstance) -> Result<WidgetInstance>;

    /// Persist style, config and position of an existing instance.
    fn save(&self, instance: &WidgetInstance) -> Result<()>;

    /// Returns whether a row was deleted.
    fn delete(&self, dashboard_id: DashboardId, id: InstanceId) -> Result<bool>;

    fn update_position(&self, id: InstanceId, position: &Position) -> Result<()>;

    fn update_state(&self, id: InstanceId, state: WidgetState) -> Result<()>;

    /// Write timestamp, log, optional data and state in one statement.
    fn update_execution_outcome(&self, id: InstanceId, outcome: &ExecutionOutcome<'_>) -> Result<()>;

    fn list_by_dashboard(&self, dashboard_id: DashboardId) -> Result<Vec<WidgetInstance>>;

    fn list_all(&self) -> Result<Vec<WidgetInstance>>;

    /// Put every instance back to STOPPED. Returns the number of rows touched.
    fn reset_states(&self) -> Result<usize>;

    fn get_dashboard(&self, id: DashboardId) -> Result<Option<Dashboard>>;
}

/// Read access to widget definitions and their category defaults.
pub trait DefinitionSource: Send + Sync {
    fn get_definition(&self, widget_id: WidgetId) -> Result<Option<WidgetDefinition>>;

    /// Widget parameters unioned with the category's; widget values win on name collision.
    fn parameters_with_category_defaults(&self, widget_id: WidgetId) -> Result<Vec<WidgetParam>>;
}
