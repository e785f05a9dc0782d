use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::models::{
    CoreError, CoreErrorKind, PageRequest, PageResult, ServiceId, ServiceRecord, ServiceState,
};
use crate::persistence::{PersistenceResult, ServiceStore, missing_record_error};

#[derive(Default)]
pub struct InMemoryServiceStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    last_id: u64,
    records: BTreeMap<ServiceId, ServiceRecord>,
}

impl InMemoryServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock_state().map(|state| state.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| {
            CoreError::new(
                CoreErrorKind::Internal,
                "in-memory service store mutex poisoned",
            )
        })
    }
}

impl ServiceStore for InMemoryServiceStore {
    fn save(&self, record: &ServiceRecord) -> PersistenceResult<ServiceRecord> {
        let mut state = self.lock_state()?;
        state.last_id = state.last_id.saturating_add(1);
        let id = ServiceId(state.last_id);
        let mut saved = record.clone();
        saved.id = Some(id);
        saved.modified_at = SystemTime::now();
        state.records.insert(id, saved.clone());
        Ok(saved)
    }

    fn update(&self, record: &ServiceRecord) -> PersistenceResult<()> {
        let id = record.required_id()?;
        let mut state = self.lock_state()?;
        let slot = state
            .records
            .get_mut(&id)
            .ok_or_else(|| missing_record_error(id))?;
        *slot = record.clone();
        Ok(())
    }

    fn find_by_id(&self, id: ServiceId) -> PersistenceResult<Option<ServiceRecord>> {
        Ok(self.lock_state()?.records.get(&id).cloned())
    }

    fn find_by_state(
        &self,
        states: &[ServiceState],
        page: PageRequest,
    ) -> PersistenceResult<PageResult<ServiceRecord>> {
        let state = self.lock_state()?;
        let matching = state
            .records
            .values()
            .filter(|record| states.contains(&record.state))
            .skip(page.offset())
            .take(page.page_size)
            .cloned()
            .collect();
        Ok(PageResult::new(page, matching))
    }

    fn find_child_services(&self, parent_id: ServiceId) -> PersistenceResult<Vec<ServiceRecord>> {
        let state = self.lock_state()?;
        Ok(state
            .records
            .values()
            .filter(|record| record.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    fn find_service_hierarchy(&self, id: ServiceId) -> PersistenceResult<Vec<ServiceRecord>> {
        let state = self.lock_state()?;
        let root = state
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| missing_record_error(id))?;

        let mut hierarchy = vec![root];
        let mut cursor = 0;
        while cursor < hierarchy.len() {
            let parent = hierarchy[cursor].id;
            hierarchy.extend(
                state
                    .records
                    .values()
                    .filter(|record| record.parent_id.is_some() && record.parent_id == parent)
                    .cloned(),
            );
            cursor += 1;
        }
        Ok(hierarchy)
    }
}
