use std::collections::BTreeMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::crm::{AttributeValue, ColumnSet, Entity};
use crate::{CoreError, CrmService};

/// In-memory stand-in for the CRM. Behaves like the remote service for the
/// operations the inquiry service uses: unknown records are errors, updates
/// merge attributes.
pub struct InMemoryCrm {
    records: Mutex<BTreeMap<(String, Uuid), Entity>>,
}

impl InMemoryCrm {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
        }
    }

    fn records(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, Uuid), Entity>>, CoreError> {
        self.records
            .lock()
            .map_err(|_| CoreError::Crm("mutex poisoned".into()))
    }

    /// Snapshot of a stored record.
    pub fn get(&self, logical_name: &str, id: Uuid) -> Option<Entity> {
        self.records
            .lock()
            .ok()
            .and_then(|m| m.get(&(logical_name.to_string(), id)).cloned())
    }

    /// Set a text attribute directly, as a CRM user answering an inquiry would.
    pub fn set_text(
        &self,
        logical_name: &str,
        id: Uuid,
        field: &str,
        value: &str,
    ) -> Result<(), CoreError> {
        let mut map = self.records()?;
        let entity = map
            .get_mut(&(logical_name.to_string(), id))
            .ok_or_else(|| missing(logical_name, id))?;
        entity.set(field, AttributeValue::Text(value.to_string()));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCrm {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(logical_name: &str, id: Uuid) -> CoreError {
    CoreError::Crm(format!("{}({}) does not exist", logical_name, id))
}

impl CrmService for InMemoryCrm {
    async fn retrieve(
        &self,
        logical_name: &str,
        id: Uuid,
        columns: &ColumnSet,
    ) -> Result<Entity, CoreError> {
        let map = self.records()?;
        map.get(&(logical_name.to_string(), id))
            .map(|e| e.project(columns))
            .ok_or_else(|| missing(logical_name, id))
    }

    async fn create(&self, entity: &Entity) -> Result<Uuid, CoreError> {
        let mut map = self.records()?;
        let id = if entity.id.is_nil() {
            Uuid::new_v4()
        } else {
            entity.id
        };
        let key = (entity.logical_name.clone(), id);
        if map.contains_key(&key) {
            return Err(CoreError::Crm(format!(
                "{}({}) already exists",
                entity.logical_name, id
            )));
        }
        let mut stored = entity.clone();
        stored.id = id;
        map.insert(key, stored);
        Ok(id)
    }

    async fn update(&self, entity: &Entity) -> Result<(), CoreError> {
        let mut map = self.records()?;
        let stored = map
            .get_mut(&(entity.logical_name.clone(), entity.id))
            .ok_or_else(|| missing(&entity.logical_name, entity.id))?;
        for (name, value) in entity.attributes() {
            stored.set(name, value.clone());
        }
        Ok(())
    }

    async fn delete(&self, logical_name: &str, id: Uuid) -> Result<(), CoreError> {
        let mut map = self.records()?;
        map.remove(&(logical_name.to_string(), id))
            .map(|_| ())
            .ok_or_else(|| missing(logical_name, id))
    }
}
