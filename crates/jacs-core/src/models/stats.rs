use serde::{Deserialize, Serialize};

use crate::models::ServiceId;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerStats {
    pub available_slots: i64,
    pub waiting_services: Vec<ServiceId>,
    pub running_services: Vec<ServiceId>,
}

impl ServerStats {
    pub fn waiting_count(&self) -> usize {
        self.waiting_services.len()
    }

    pub fn running_count(&self) -> usize {
        self.running_services.len()
    }
}
