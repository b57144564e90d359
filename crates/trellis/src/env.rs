//! Hierarchical variable environment.
//!
//! Topic templates and identity strings contain `{name}` placeholders
//! expanded against an environment. Environments form a chain: lookups
//! fall back to the parent, so a transport can layer per-message
//! variables (a command uuid, a username) over the process-wide device
//! identity without mutating it.

use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use trellis_api::{Error, Result};

use crate::config::{DeviceConfig, DeviceIdSource};

#[derive(Debug)]
pub struct Environment {
    variables: RwLock<HashMap<String, String>>,
    parent: Option<Arc<Environment>>,
    case_sensitive: bool,
}

impl Environment {
    /// Creates an empty environment. Case sensitivity is inherited
    /// from the parent, defaulting to insensitive.
    pub fn new(parent: Option<Arc<Environment>>) -> Self {
        let case_sensitive = parent.as_ref().map(|p| p.case_sensitive).unwrap_or(false);
        Environment {
            variables: RwLock::new(HashMap::new()),
            parent,
            case_sensitive,
        }
    }

    pub fn new_case_sensitive(parent: Option<Arc<Environment>>) -> Self {
        Environment {
            variables: RwLock::new(HashMap::new()),
            parent,
            case_sensitive: true,
        }
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn conv_name(&self, name: &str) -> String {
        if self.case_sensitive {
            name.to_string()
        } else {
            name.to_lowercase()
        }
    }

    pub fn set(&self, name: &str, value: impl Into<String>) -> &Self {
        let key = self.conv_name(name);
        self.variables.write().unwrap().insert(key, value.into());
        self
    }

    pub fn set_from_map(&self, variables: &HashMap<String, String>) {
        let mut guard = self.variables.write().unwrap();
        for (name, value) in variables {
            guard.insert(self.conv_name(name), value.clone());
        }
    }

    /// Looks up a variable here or in any parent.
    pub fn get(&self, name: &str) -> Option<String> {
        let key = self.conv_name(name);
        if let Some(value) = self.variables.read().unwrap().get(&key) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|p| p.get(name))
    }

    /// Whether a non-empty variable is defined here or in any parent.
    pub fn exists(&self, name: &str) -> bool {
        self.get(name).map(|v| !v.is_empty()).unwrap_or(false)
    }

    /// Removes all variables from this scope. Parents are untouched.
    pub fn clear(&self) {
        self.variables.write().unwrap().clear();
    }

    /// Flattens the whole chain into one map, child scopes winning.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut result = self
            .parent
            .as_ref()
            .map(|p| p.to_map())
            .unwrap_or_default();
        for (name, value) in self.variables.read().unwrap().iter() {
            result.insert(name.clone(), value.clone());
        }
        result
    }

    /// Replaces every `{name}` placeholder in `template` with the
    /// variable's value. Unmatched braces and unknown or empty
    /// variables are errors.
    pub fn expand(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut variable_name: Option<String> = None;

        for ch in template.chars() {
            match ch {
                '{' => {
                    if variable_name.is_some() {
                        return Err(Error::Config(format!(
                            "unmatched left brace in template '{template}'"
                        )));
                    }
                    variable_name = Some(String::new());
                }
                '}' => match variable_name.take() {
                    Some(name) => {
                        let value = self.get(&name).unwrap_or_default();
                        if value.is_empty() {
                            return Err(Error::Config(format!(
                                "variable '{name}' not found expanding '{template}'"
                            )));
                        }
                        out.push_str(&value);
                    }
                    None => {
                        return Err(Error::Config(format!(
                            "unmatched right brace in template '{template}'"
                        )));
                    }
                },
                _ => match variable_name.as_mut() {
                    Some(name) => name.push(ch),
                    None => out.push(ch),
                },
            }
        }

        if variable_name.is_some() {
            return Err(Error::Config(format!(
                "unmatched left brace in template '{template}'"
            )));
        }

        Ok(out)
    }
}

static GLOBAL_ENV: OnceCell<Arc<Environment>> = OnceCell::new();

/// Builds the process-wide environment from the device identity
/// configuration: hostname, the predefined identity variables, any
/// custom variables, and the resolved `deviceId`.
pub fn init_global(config: &DeviceConfig) -> Result<Arc<Environment>> {
    if let Some(env) = GLOBAL_ENV.get() {
        return Ok(env.clone());
    }

    let env = if config.case_sensitive_variables {
        Environment::new_case_sensitive(None)
    } else {
        Environment::new(None)
    };

    let hostname = hostname()?;
    env.set("hostname", hostname.clone());

    env.set("deviceId", config.device_id.clone());
    env.set("customerId", config.customer_id.clone());
    env.set("tenantId", config.tenant_id.clone());
    env.set("tenantName", config.tenant_name.clone());
    env.set_from_map(&config.variables);

    match config.device_id_source {
        DeviceIdSource::Config => {
            if config.device_id.is_empty() {
                return Err(Error::Config(
                    "device id source is 'config' but no device id is set".into(),
                ));
            }
        }
        DeviceIdSource::Hostname => {
            env.set("deviceId", hostname);
        }
        DeviceIdSource::Mac => {
            let mac = read_mac_address()?.replace(':', "");
            env.set("deviceId", mac);
        }
    }

    tracing::debug!(device_id = %env.get("deviceId").unwrap_or_default(), "variables environment initialized");

    let env = Arc::new(env);
    let _ = GLOBAL_ENV.set(env.clone());
    Ok(GLOBAL_ENV.get().expect("global environment just set").clone())
}

/// The process-wide environment, if initialized.
pub fn global() -> Result<Arc<Environment>> {
    GLOBAL_ENV
        .get()
        .cloned()
        .ok_or_else(|| Error::Config("variables environment is not initialized".into()))
}

fn hostname() -> Result<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| std::fs::read_to_string("/etc/hostname"))
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::Config(format!("failed to read hostname: {e}")))
}

/// Reads the MAC address of the first operational network interface.
fn read_mac_address() -> Result<String> {
    let entries = std::fs::read_dir("/sys/class/net")
        .map_err(|e| Error::Config(format!("failed to list network interfaces: {e}")))?;

    for entry in entries.flatten() {
        let name = entry.file_name();
        if name == "lo" {
            continue;
        }
        let path = entry.path();
        let operstate = std::fs::read_to_string(path.join("operstate")).unwrap_or_default();
        if operstate.trim() != "up" {
            continue;
        }
        if let Ok(address) = std::fs::read_to_string(path.join("address")) {
            let address = address.trim();
            if !address.is_empty() {
                return Ok(address.to_string());
            }
        }
    }

    Err(Error::Config(
        "no active network interface with a MAC address found".into(),
    ))
}
