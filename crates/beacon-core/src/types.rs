use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary key of a placed widget instance.
pub type InstanceId = i64;
/// Primary key of a dashboard.
pub type DashboardId = i64;
/// Primary key of a widget definition.
pub type WidgetId = i64;
/// Primary key of a widget category.
pub type CategoryId = i64;

/// Value type of a widget parameter. Only `Password` values are encrypted at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParamType {
    Text,
    Password,
    Number,
    Boolean,
    Combo,
    Multiple,
    Space,
}

/// One entry of a widget (or category) parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetParam {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<String>,
}

impl WidgetParam {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default_value: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn is_secret(&self) -> bool {
        self.param_type == ParamType::Password
    }
}

/// Union of widget-specific and category-level parameters.
///
/// Widget parameters come first in their declared order; category parameters
/// follow, skipping any whose name the widget already declares.
pub fn merge_parameters(widget: &[WidgetParam], category: &[WidgetParam]) -> Vec<WidgetParam> {
    let mut merged: Vec<WidgetParam> = widget.to_vec();
    for param in category {
        if !merged.iter().any(|p| p.name == param.name) {
            merged.push(param.clone());
        }
    }
    merged
}

/// A grouping of widget definitions sharing default parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    pub technical_name: String,
    #[serde(default)]
    pub parameters: Vec<WidgetParam>,
}

/// The reusable script and parameter schema an instance is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetDefinition {
    pub id: WidgetId,
    pub technical_name: String,
    pub category_id: Option<CategoryId>,
    /// Widget-specific parameters only; see [`merge_parameters`].
    #[serde(default)]
    pub parameters: Vec<WidgetParam>,
    pub script: String,
    /// Refresh interval in seconds. `None` or 0 falls back to the instance or global setting.
    pub delay_secs: Option<u64>,
    /// Execution budget in seconds, overriding the sandbox default.
    pub timeout_secs: Option<u64>,
}

/// A board that widget instances are placed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dashboard {
    pub id: DashboardId,
    pub name: String,
    /// Subscription token viewers use to receive updates.
    pub token: String,
}

/// Grid placement of an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub col: i32,
    pub row: i32,
    pub width: i32,
    pub height: i32,
}

/// Lifecycle state of a widget instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WidgetState {
    /// Not scheduled. Initial, and terminal after FATAL or removal.
    #[default]
    Stopped,
    /// A handle is armed or the script is executing.
    Running,
    /// Last execution succeeded.
    Success,
    /// Last execution failed with a CONTINUE-class error.
    Warning,
}

impl std::fmt::Display for WidgetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WidgetState::Stopped => "STOPPED",
            WidgetState::Running => "RUNNING",
            WidgetState::Success => "SUCCESS",
            WidgetState::Warning => "WARNING",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WidgetState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "STOPPED" => Ok(WidgetState::Stopped),
            "RUNNING" => Ok(WidgetState::Running),
            "SUCCESS" => Ok(WidgetState::Success),
            "WARNING" => Ok(WidgetState::Warning),
            other => Err(format!("unknown widget state: {other}")),
        }
    }
}

/// A placed, configured occurrence of a widget definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetInstance {
    pub id: InstanceId,
    pub dashboard_id: DashboardId,
    pub widget_id: WidgetId,
    /// `key=value` lines; PASSWORD values are ciphertext.
    pub backend_config: String,
    pub custom_style: Option<String>,
    pub position: Position,
    /// Output of the last successful run, serialized JSON.
    pub data: Option<String>,
    pub log: Option<String>,
    pub state: WidgetState,
    pub last_execution_date: Option<DateTime<Utc>>,
}

/// Input for creating an instance; the store assigns the id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewWidgetInstance {
    pub dashboard_id: DashboardId,
    pub widget_id: WidgetId,
    /// Plaintext `key=value` lines as typed by the editor.
    pub backend_config: String,
    pub custom_style: Option<String>,
    #[serde(default)]
    pub position: Position,
}

/// Failure severity: whether the recurrence keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Retry on the normal schedule.
    Continue,
    /// Stop rescheduling until an explicit reschedule.
    Fatal,
}

/// Outcome of one script execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        data: String,
        log: String,
        timestamp: DateTime<Utc>,
    },
    Failure {
        kind: ErrorKind,
        log: String,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionResult {
    pub fn success(data: impl Into<String>, log: impl Into<String>) -> Self {
        ExecutionResult::Success {
            data: data.into(),
            log: log.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(kind: ErrorKind, log: impl Into<String>) -> Self {
        ExecutionResult::Failure {
            kind,
            log: log.into(),
            timestamp: Utc::now(),
        }
    }

    /// State the instance lands in once this result is recorded.
    pub fn resulting_state(&self) -> WidgetState {
        match self {
            ExecutionResult::Success { .. } => WidgetState::Success,
            ExecutionResult::Failure {
                kind: ErrorKind::Continue,
                ..
            } => WidgetState::Warning,
            ExecutionResult::Failure {
                kind: ErrorKind::Fatal,
                ..
            } => WidgetState::Stopped,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecutionResult::Failure {
                kind: ErrorKind::Fatal,
                ..
            }
        )
    }

    pub fn log(&self) -> &str {
        match self {
            ExecutionResult::Success { log, .. } | ExecutionResult::Failure { log, .. } => log,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ExecutionResult::Success { timestamp, .. }
            | ExecutionResult::Failure { timestamp, .. } => *timestamp,
        }
    }

    /// Output data, present only on success.
    pub fn data(&self) -> Option<&str> {
        match self {
            ExecutionResult::Success { data, .. } => Some(data),
            ExecutionResult::Failure { .. } => None,
        }
    }
}

/// What changed, so viewers know how much to re-render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateType {
    Grid,
    Position,
    Widget,
}

/// A push notification delivered to dashboard viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    /// Serialized snapshot of the affected dashboard or instance.
    pub content: serde_json::Value,
    pub date: DateTime<Utc>,
}

impl UpdateEvent {
    pub fn new(update_type: UpdateType, content: serde_json::Value) -> Self {
        Self {
            update_type,
            content,
            date: Utc::now(),
        }
    }
}

/// Viewer-safe projection of an instance: no backend config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    pub id: InstanceId,
    pub widget_id: WidgetId,
    pub custom_style: Option<String>,
    pub position: Position,
    pub data: Option<String>,
    pub log: Option<String>,
    pub state: WidgetState,
    pub last_execution_date: Option<DateTime<Utc>>,
}

impl From<&WidgetInstance> for InstanceView {
    fn from(instance: &WidgetInstance) -> Self {
        Self {
            id: instance.id,
            widget_id: instance.widget_id,
            custom_style: instance.custom_style.clone(),
            position: instance.position,
            data: instance.data.clone(),
            log: instance.log.clone(),
            state: instance.state,
            last_execution_date: instance.last_execution_date,
        }
    }
}

/// A dashboard together with every instance placed on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub id: DashboardId,
    pub name: String,
    pub token: String,
    pub instances: Vec<InstanceView>,
}

impl DashboardSnapshot {
    pub fn new(dashboard: &Dashboard, instances: &[WidgetInstance]) -> Self {
        Self {
            id: dashboard.id,
            name: dashboard.name.clone(),
            token: dashboard.token.clone(),
            instances: instances.iter().map(InstanceView::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widget_params_win_over_category_defaults() {
        let widget = vec![
            WidgetParam::new("url", ParamType::Text).required(),
            WidgetParam::new("token", ParamType::Password),
        ];
        let category = vec![
            WidgetParam::new("url", ParamType::Text).with_default("http://category"),
            WidgetParam::new("proxy", ParamType::Text).with_default("none"),
        ];
        let merged = merge_parameters(&widget, &category);
        let names: Vec<&str> = merged.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["url", "token", "proxy"]);
        assert!(merged[0].required);
        assert_eq!(merged[0].default_value, None);
        assert_eq!(merged[2].default_value.as_deref(), Some("none"));
    }

    #[test]
    fn state_display_round_trips() {
        for state in [
            WidgetState::Stopped,
            WidgetState::Running,
            WidgetState::Success,
            WidgetState::Warning,
        ] {
            let parsed: WidgetState = state.to_string().parse().expect("parse");
            assert_eq!(parsed, state);
        }
        assert!("PAUSED".parse::<WidgetState>().is_err());
    }

    #[test]
    fn resulting_state_follows_severity() {
        assert_eq!(
            ExecutionResult::success("{}", "").resulting_state(),
            WidgetState::Success
        );
        assert_eq!(
            ExecutionResult::failure(ErrorKind::Continue, "boom").resulting_state(),
            WidgetState::Warning
        );
        let fatal = ExecutionResult::failure(ErrorKind::Fatal, "no interpreter");
        assert_eq!(fatal.resulting_state(), WidgetState::Stopped);
        assert!(fatal.is_fatal());
        assert_eq!(fatal.data(), None);
    }

    #[test]
    fn update_event_serializes_type_tag() {
        let ev = UpdateEvent::new(UpdateType::Grid, serde_json::json!({"id": 1}));
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"GRID""#));
    }
}
