use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{CoreError, CoreErrorKind, CoreResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub u64);

impl Display for ServiceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Created,
    Queued,
    Running,
    Successful,
    Error,
    Canceled,
}

impl ServiceState {
    pub const ALL: [ServiceState; 6] = [
        Self::Created,
        Self::Queued,
        Self::Running,
        Self::Successful,
        Self::Error,
        Self::Canceled,
    ];

    /// States a restarted dispatcher must pick back up.
    pub const PENDING: [ServiceState; 2] = [Self::Queued, Self::Running];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Successful => "SUCCESSFUL",
            Self::Error => "ERROR",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Error | Self::Canceled)
    }

    pub fn is_unsuccessful(self) -> bool {
        matches!(self, Self::Error | Self::Canceled)
    }

    pub fn can_transition_to(self, next: ServiceState) -> bool {
        match (self, next) {
            (Self::Created, Self::Queued) => true,
            (Self::Queued, Self::Running | Self::Error | Self::Canceled) => true,
            // a record left RUNNING by a crashed process is admitted again
            (Self::Running, Self::Running) => true,
            (Self::Running, Self::Successful | Self::Error | Self::Canceled) => true,
            _ => false,
        }
    }
}

impl std::str::FromStr for ServiceState {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("unknown service state '{value}'"),
                )
            })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceEventType {
    Created,
    Queued,
    Started,
    Recovered,
    Completed,
    Failed,
    Timeout,
    Canceled,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub event_type: ServiceEventType,
    pub message: String,
    pub created_at: SystemTime,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: Option<ServiceId>,
    pub name: String,
    pub state: ServiceState,
    pub parent_id: Option<ServiceId>,
    pub root_id: Option<ServiceId>,
    pub dependency_ids: Vec<ServiceId>,
    pub parameters: BTreeMap<String, Value>,
    pub working_directory: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub events: Vec<ServiceEvent>,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
    pub process_started_at: Option<SystemTime>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            id: None,
            name: name.into(),
            state: ServiceState::Created,
            parent_id: None,
            root_id: None,
            dependency_ids: Vec::new(),
            parameters: BTreeMap::new(),
            working_directory: None,
            timeout: None,
            result: None,
            error_message: None,
            events: Vec::new(),
            created_at: now,
            modified_at: now,
            process_started_at: None,
        }
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameters(mut self, parameters: BTreeMap<String, Value>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn depends_on(mut self, dependency: ServiceId) -> Self {
        if !self.dependency_ids.contains(&dependency) {
            self.dependency_ids.push(dependency);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Links this record under `parent`, inheriting the parent's root.
    pub fn update_parent(&mut self, parent: &ServiceRecord) {
        self.parent_id = parent.id;
        self.root_id = parent.root_id.or(parent.id);
    }

    pub fn has_completed(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn has_completed_successfully(&self) -> bool {
        self.state == ServiceState::Successful
    }

    pub fn has_completed_unsuccessfully(&self) -> bool {
        self.state.is_unsuccessful()
    }

    pub fn required_id(&self) -> CoreResult<ServiceId> {
        self.id.ok_or_else(|| {
            CoreError::for_record(
                self,
                CoreErrorKind::InvalidInput,
                format!("service '{}' has not been persisted yet", self.name),
            )
        })
    }

    pub fn transition_to(&mut self, next: ServiceState) -> CoreResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::for_record(
                self,
                CoreErrorKind::InvalidInput,
                format!(
                    "service '{}' cannot transition from '{}' to '{}'",
                    self.display_id(),
                    self.state.as_str(),
                    next.as_str()
                ),
            ));
        }
        self.state = next;
        self.modified_at = SystemTime::now();
        Ok(())
    }

    pub fn add_event(&mut self, event_type: ServiceEventType, message: impl Into<String>) {
        let now = SystemTime::now();
        self.events.push(ServiceEvent {
            event_type,
            message: message.into(),
            created_at: now,
        });
        self.modified_at = now;
    }

    pub fn get_result<T: DeserializeOwned>(&self) -> CoreResult<Option<T>> {
        let Some(result) = &self.result else {
            return Ok(None);
        };
        serde_json::from_value(result.clone()).map(Some).map_err(|error| {
            CoreError::for_record(
                self,
                CoreErrorKind::InvalidInput,
                format!("stored result does not match the requested type: {error}"),
            )
        })
    }

    pub fn set_result<T: Serialize>(&mut self, result: &T) -> CoreResult<()> {
        let value = serde_json::to_value(result).map_err(|error| {
            CoreError::for_record(
                self,
                CoreErrorKind::Internal,
                format!("failed to serialize service result: {error}"),
            )
        })?;
        self.result = Some(value);
        self.modified_at = SystemTime::now();
        Ok(())
    }

    pub fn string_parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn display_id(&self) -> String {
        self.id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<unsaved>".to_string())
    }
}
