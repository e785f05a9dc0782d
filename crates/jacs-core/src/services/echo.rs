use std::time::Duration;

use serde_json::Value;

use crate::computation::{ComputationFuture, ServiceComputation, ServiceContext};
use crate::models::{ServiceMetaData, ServiceRecord};

pub const ECHO_SERVICE: &str = "echo";

const DEFAULT_DELAY_MS: u64 = 10;

pub fn echo_metadata() -> ServiceMetaData {
    // no declared default: the result must be exactly the submitted parameters
    ServiceMetaData::new(ECHO_SERVICE, "Returns its parameters as the result").optional_arg(
        "delay_ms",
        "milliseconds to wait before completing (10 when unset)",
        None,
    )
}

pub struct EchoService;

impl ServiceComputation for EchoService {
    fn process_data<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        Box::pin(async move {
            let delay = record
                .parameters
                .get("delay_ms")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_DELAY_MS);
            ctx.sleep(&record, Duration::from_millis(delay)).await?;

            let mut record = record;
            let echoed = record.parameters.clone();
            record.set_result(&echoed)?;
            Ok(record)
        })
    }
}
