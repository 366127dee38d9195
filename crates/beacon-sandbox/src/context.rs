use beacon_core::{BackendConfig, InstanceId, WidgetParam};

/// Global holding the executing instance's id.
pub const INSTANCE_ID_VARIABLE: &str = "WIDGET_INSTANCE_ID";
/// Global object holding every context variable, including non-identifier names.
pub const CONFIG_VARIABLE: &str = "WIDGET_CONFIG";

/// Everything a script is allowed to see for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptContext {
    pub instance_id: InstanceId,
    pub variables: BackendConfig,
}

impl ScriptContext {
    /// Merge decrypted instance values with parameter defaults.
    ///
    /// Declared parameters come first, each taking the configured value or
    /// else its default. Configured keys no parameter declares follow.
    pub fn build(instance_id: InstanceId, params: &[WidgetParam], config: &BackendConfig) -> Self {
        let mut variables = BackendConfig::new();
        for param in params {
            match config.get(&param.name) {
                Some(value) => variables.set(param.name.clone(), value),
                None => {
                    if let Some(ref default) = param.default_value {
                        variables.set(param.name.clone(), default.clone());
                    }
                }
            }
        }
        for (key, value) in config.iter() {
            if !variables.contains_key(key) {
                variables.set(key, value);
            }
        }
        Self {
            instance_id,
            variables,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name)
    }
}
