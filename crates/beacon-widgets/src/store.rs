use std::sync::Mutex;

use beacon_core::{
    merge_parameters, BeaconError, Category, Dashboard, DashboardId, DefinitionSource,
    ExecutionOutcome, InstanceId, InstanceStore, NewWidgetInstance, Position, Result,
    WidgetDefinition, WidgetId, WidgetInstance, WidgetParam, WidgetState,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

const INSTANCE_COLUMNS: &str = "id, dashboard_id, widget_id, backend_config, custom_style,
     col, row, width, height, data, log, state, last_execution_date";

const WIDGET_COLUMNS: &str =
    "id, technical_name, category_id, parameters, script, delay_secs, timeout_secs";

/// Input for registering a widget definition; the store assigns the id.
#[derive(Debug, Clone, Default)]
pub struct NewWidget {
    pub technical_name: String,
    pub category_id: Option<i64>,
    pub parameters: Vec<WidgetParam>,
    pub script: String,
    pub delay_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
}

/// SQLite-backed record of dashboards, widget definitions and instances.
///
/// Wraps a single connection in a `Mutex`. Every statement runs under the
/// lock, which also makes the store the serialization point for
/// conflicting writes to the same instance.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Create a dashboard with a fresh random subscription token.
    #[instrument(skip(self))]
    pub fn create_dashboard(&self, name: &str) -> Result<Dashboard> {
        let token = Uuid::new_v4().to_string();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO dashboards (name, token) VALUES (?1, ?2)",
            rusqlite::params![name, token],
        )
        .map_err(db_err)?;
        Ok(Dashboard {
            id: db.last_insert_rowid(),
            name: name.to_string(),
            token,
        })
    }

    /// Insert or update a category by technical name, keeping its id.
    #[instrument(skip(self, parameters))]
    pub fn upsert_category(
        &self,
        name: &str,
        technical_name: &str,
        parameters: &[WidgetParam],
    ) -> Result<Category> {
        let params_json = serde_json::to_string(parameters)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO categories (name, technical_name, parameters) VALUES (?1, ?2, ?3)
             ON CONFLICT(technical_name) DO UPDATE SET
                 name = excluded.name,
                 parameters = excluded.parameters",
            rusqlite::params![name, technical_name, params_json],
        )
        .map_err(db_err)?;
        let id: i64 = db
            .query_row(
                "SELECT id FROM categories WHERE technical_name = ?1",
                rusqlite::params![technical_name],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(Category {
            id,
            name: name.to_string(),
            technical_name: technical_name.to_string(),
            parameters: parameters.to_vec(),
        })
    }

    #[instrument(skip(self, widget), fields(technical_name = %widget.technical_name))]
    pub fn insert_widget(&self, widget: &NewWidget) -> Result<WidgetDefinition> {
        let params_json = serde_json::to_string(&widget.parameters)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO widgets
             (technical_name, category_id, parameters, script, delay_secs, timeout_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                widget.technical_name,
                widget.category_id,
                params_json,
                widget.script,
                widget.delay_secs.map(|s| s as i64),
                widget.timeout_secs.map(|s| s as i64),
            ],
        )
        .map_err(db_err)?;
        Ok(WidgetDefinition {
            id: db.last_insert_rowid(),
            technical_name: widget.technical_name.clone(),
            category_id: widget.category_id,
            parameters: widget.parameters.clone(),
            script: widget.script.clone(),
            delay_secs: widget.delay_secs,
            timeout_secs: widget.timeout_secs,
        })
    }

    fn category_parameters(db: &Connection, category_id: i64) -> Result<Vec<WidgetParam>> {
        let json: Option<String> = db
            .query_row(
                "SELECT parameters FROM categories WHERE id = ?1",
                rusqlite::params![category_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }
}

impl InstanceStore for SqliteStore {
    #[instrument(skip(self))]
    fn get(&self, id: InstanceId) -> Result<Option<WidgetInstance>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {INSTANCE_COLUMNS} FROM widget_instances WHERE id = ?1"),
            rusqlite::params![id],
            row_to_instance,
        )
        .optional()
        .map_err(db_err)
    }

    #[instrument(skip(self, instance), fields(dashboard_id = instance.dashboard_id, widget_id = instance.widget_id))]
    fn insert(&self, instance: &NewWidgetInstance) -> Result<WidgetInstance> {
        let p = instance.position;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO widget_instances
             (dashboard_id, widget_id, backend_config, custom_style, col, row, width, height, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                instance.dashboard_id,
                instance.widget_id,
                instance.backend_config,
                instance.custom_style,
                p.col,
                p.row,
                p.width,
                p.height,
                WidgetState::Stopped.to_string(),
            ],
        )
        .map_err(db_err)?;
        let id = db.last_insert_rowid();
        debug!(instance_id = id, "instance inserted");
        Ok(WidgetInstance {
            id,
            dashboard_id: instance.dashboard_id,
            widget_id: instance.widget_id,
            backend_config: instance.backend_config.clone(),
            custom_style: instance.custom_style.clone(),
            position: p,
            data: None,
            log: None,
            state: WidgetState::Stopped,
            last_execution_date: None,
        })
    }

    #[instrument(skip(self, instance), fields(instance_id = instance.id))]
    fn save(&self, instance: &WidgetInstance) -> Result<()> {
        let p = instance.position;
        let db = self.db.lock().unwrap();
        let changed = db
            .execute(
                "UPDATE widget_instances
                 SET backend_config = ?1, custom_style = ?2,
                     col = ?3, row = ?4, width = ?5, height = ?6
                 WHERE id = ?7",
                rusqlite::params![
                    instance.backend_config,
                    instance.custom_style,
                    p.col,
                    p.row,
                    p.width,
                    p.height,
                    instance.id,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(BeaconError::not_found("instance", instance.id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn delete(&self, dashboard_id: DashboardId, id: InstanceId) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let changed = db
            .execute(
                "DELETE FROM widget_instances WHERE id = ?1 AND dashboard_id = ?2",
                rusqlite::params![id, dashboard_id],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    #[instrument(skip(self))]
    fn update_position(&self, id: InstanceId, position: &Position) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db
            .execute(
                "UPDATE widget_instances SET col = ?1, row = ?2, width = ?3, height = ?4
                 WHERE id = ?5",
                rusqlite::params![position.col, position.row, position.width, position.height, id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(BeaconError::not_found("instance", id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn update_state(&self, id: InstanceId, state: WidgetState) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db
            .execute(
                "UPDATE widget_instances SET state = ?1 WHERE id = ?2",
                rusqlite::params![state.to_string(), id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(BeaconError::not_found("instance", id));
        }
        Ok(())
    }

    #[instrument(skip(self, outcome), fields(state = %outcome.state))]
    fn update_execution_outcome(&self, id: InstanceId, outcome: &ExecutionOutcome<'_>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db
            .execute(
                "UPDATE widget_instances
                 SET last_execution_date = ?1,
                     log = ?2,
                     data = COALESCE(?3, data),
                     state = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    outcome.timestamp.to_rfc3339(),
                    outcome.log,
                    outcome.data,
                    outcome.state.to_string(),
                    id,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(BeaconError::not_found("instance", id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn list_by_dashboard(&self, dashboard_id: DashboardId) -> Result<Vec<WidgetInstance>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM widget_instances
                 WHERE dashboard_id = ?1 ORDER BY row, col, id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params![dashboard_id], row_to_instance)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    #[instrument(skip(self))]
    fn list_all(&self) -> Result<Vec<WidgetInstance>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db
            .prepare(&format!("SELECT {INSTANCE_COLUMNS} FROM widget_instances ORDER BY id"))
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_instance).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    #[instrument(skip(self))]
    fn reset_states(&self) -> Result<usize> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE widget_instances SET state = ?1",
            rusqlite::params![WidgetState::Stopped.to_string()],
        )
        .map_err(db_err)
    }

    #[instrument(skip(self))]
    fn get_dashboard(&self, id: DashboardId) -> Result<Option<Dashboard>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, name, token FROM dashboards WHERE id = ?1",
            rusqlite::params![id],
            |row| {
                Ok(Dashboard {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    token: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }
}

impl DefinitionSource for SqliteStore {
    #[instrument(skip(self))]
    fn get_definition(&self, widget_id: WidgetId) -> Result<Option<WidgetDefinition>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {WIDGET_COLUMNS} FROM widgets WHERE id = ?1"),
            rusqlite::params![widget_id],
            row_to_definition,
        )
        .optional()
        .map_err(db_err)
    }

    #[instrument(skip(self))]
    fn parameters_with_category_defaults(&self, widget_id: WidgetId) -> Result<Vec<WidgetParam>> {
        let db = self.db.lock().unwrap();
        let definition = db
            .query_row(
                &format!("SELECT {WIDGET_COLUMNS} FROM widgets WHERE id = ?1"),
                rusqlite::params![widget_id],
                row_to_definition,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| BeaconError::not_found("widget", widget_id))?;
        let category = match definition.category_id {
            Some(category_id) => Self::category_parameters(&db, category_id)?,
            None => Vec::new(),
        };
        Ok(merge_parameters(&definition.parameters, &category))
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> BeaconError {
    BeaconError::Database(e.to_string())
}

fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<WidgetInstance> {
    let state: String = row.get(11)?;
    let last: Option<String> = row.get(12)?;
    Ok(WidgetInstance {
        id: row.get(0)?,
        dashboard_id: row.get(1)?,
        widget_id: row.get(2)?,
        backend_config: row.get(3)?,
        custom_style: row.get(4)?,
        position: Position {
            col: row.get(5)?,
            row: row.get(6)?,
            width: row.get(7)?,
            height: row.get(8)?,
        },
        data: row.get(9)?,
        log: row.get(10)?,
        state: state
            .parse()
            .map_err(|e: String| conversion_error(11, e.into()))?,
        last_execution_date: last
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| conversion_error(12, Box::new(e)))
            })
            .transpose()?,
    })
}

fn row_to_definition(row: &Row<'_>) -> rusqlite::Result<WidgetDefinition> {
    let params_json: String = row.get(3)?;
    let delay: Option<i64> = row.get(5)?;
    let timeout: Option<i64> = row.get(6)?;
    Ok(WidgetDefinition {
        id: row.get(0)?,
        technical_name: row.get(1)?,
        category_id: row.get(2)?,
        parameters: serde_json::from_str(&params_json)
            .map_err(|e| conversion_error(3, Box::new(e)))?,
        script: row.get(4)?,
        delay_secs: delay.map(|s| s.max(0) as u64),
        timeout_secs: timeout.map(|s| s.max(0) as u64),
    })
}

fn conversion_error(
    column: usize,
    err: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, err)
}
