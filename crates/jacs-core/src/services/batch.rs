use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::computation::{ComputationFuture, ServiceComputation, ServiceContext};
use crate::models::{ServiceId, ServiceMetaData, ServiceRecord};
use crate::persistence::run_blocking;
use crate::services::invalid_parameter;

pub const BATCH_SERVICE: &str = "batch";

pub fn batch_metadata() -> ServiceMetaData {
    ServiceMetaData::new(
        BATCH_SERVICE,
        "Submits child services and collects their results",
    )
    .required_arg(
        "services",
        "list of {\"name\": ..., \"parameters\": {...}} entries",
    )
}

#[derive(Debug, Deserialize)]
struct BatchEntry {
    name: String,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
}

/// Fans out one child per entry and finishes once every child has.
///
/// The parent holds its slot while children run, so children need a free
/// slot of their own.
#[derive(Default)]
pub struct BatchService {
    submitted: Vec<ServiceId>,
}

impl BatchService {
    pub fn submitted(&self) -> &[ServiceId] {
        &self.submitted
    }
}

impl ServiceComputation for BatchService {
    fn process_data<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        Box::pin(async move {
            let entries = record
                .parameters
                .get("services")
                .cloned()
                .map(serde_json::from_value::<Vec<BatchEntry>>)
                .transpose()
                .map_err(|error| {
                    invalid_parameter(&record, format!("'services' is malformed: {error}"))
                })?
                .unwrap_or_default();

            let parent_id = record.required_id()?;
            let existing = run_blocking(ctx.store(), "find_child_services", move |store| {
                store.find_child_services(parent_id)
            })
            .await
            .map_err(|error| error.attribute(&record))?;
            if !existing.is_empty() {
                // recovered run: children were submitted before the restart
                self.submitted = existing.iter().filter_map(|child| child.id).collect();
                return Ok(record);
            }

            for entry in entries {
                let child = ServiceRecord::new(entry.name).parameters(entry.parameters);
                let child = ctx.submit_child(&record, child).await?;
                self.submitted.extend(child.id);
            }

            tracing::info!(
                service_id = %parent_id,
                children = self.submitted.len(),
                "submitted child services"
            );
            Ok(record)
        })
    }

    fn is_done<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        Box::pin(async move {
            let children = ctx.wait_for_children(&record).await?;
            let results: BTreeMap<String, Value> = children
                .into_iter()
                .filter_map(|child| {
                    let id = child.id?;
                    Some((id.to_string(), child.result.unwrap_or(Value::Null)))
                })
                .collect();

            let mut record = record;
            record.set_result(&results)?;
            Ok(record)
        })
    }
}
