use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{CoreError, CoreErrorKind, CoreResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceArgDescriptor {
    pub name: String,
    pub description: String,
    pub required: bool,
    pub default_value: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetaData {
    pub service_name: String,
    pub description: String,
    pub args: Vec<ServiceArgDescriptor>,
}

impl ServiceMetaData {
    pub fn new(service_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            description: description.into(),
            args: Vec::new(),
        }
    }

    pub fn required_arg(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.args.push(ServiceArgDescriptor {
            name: name.into(),
            description: description.into(),
            required: true,
            default_value: None,
        });
        self
    }

    pub fn optional_arg(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        default_value: Option<Value>,
    ) -> Self {
        self.args.push(ServiceArgDescriptor {
            name: name.into(),
            description: description.into(),
            required: false,
            default_value,
        });
        self
    }

    /// Checks required args and fills in declared defaults.
    pub fn resolve_parameters(
        &self,
        parameters: &BTreeMap<String, Value>,
    ) -> CoreResult<BTreeMap<String, Value>> {
        let missing: Vec<&str> = self
            .args
            .iter()
            .filter(|arg| arg.required)
            .filter(|arg| parameters.get(&arg.name).is_none_or(Value::is_null))
            .map(|arg| arg.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(CoreError {
                service: None,
                service_name: Some(self.service_name.clone()),
                kind: CoreErrorKind::InvalidInput,
                message: format!(
                    "service '{}' is missing required parameters: {}",
                    self.service_name,
                    missing.join(", ")
                ),
            });
        }

        let mut resolved = parameters.clone();
        for arg in &self.args {
            if let Some(default_value) = &arg.default_value {
                resolved
                    .entry(arg.name.clone())
                    .or_insert_with(|| default_value.clone());
            }
        }
        Ok(resolved)
    }
}
