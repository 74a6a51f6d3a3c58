use std::sync::Mutex;

use crate::{ContactId, CoreError, Inquiry, InquiryId, InquiryRepository};

/// Simple in-memory repository. Rows are kept in insertion order behind a
/// single mutex.
pub struct InMemoryInquiryRepo {
    inner: Mutex<Vec<Inquiry>>,
}

impl InMemoryInquiryRepo {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, Vec<Inquiry>>, CoreError> {
        self.inner
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

impl Default for InMemoryInquiryRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl InquiryRepository for InMemoryInquiryRepo {
    fn get(&self, id: &InquiryId) -> Result<Option<Inquiry>, CoreError> {
        let rows = self.rows()?;
        Ok(rows.iter().find(|i| i.id == *id).map(|i| Inquiry {
            response: None,
            ..i.clone()
        }))
    }

    fn insert(&self, inquiry: &Inquiry) -> Result<(), CoreError> {
        let mut rows = self.rows()?;
        if rows.iter().any(|i| i.id == inquiry.id) {
            return Err(CoreError::AlreadyExists);
        }
        // The response column does not exist locally.
        rows.push(Inquiry {
            response: None,
            ..inquiry.clone()
        });
        Ok(())
    }

    fn list_by_contact(&self, contact: &ContactId) -> Result<Vec<Inquiry>, CoreError> {
        let rows = self.rows()?;
        Ok(rows
            .iter()
            .filter(|i| i.contact_id == *contact)
            .cloned()
            .collect())
    }

    fn update(&self, inquiry: &Inquiry) -> Result<(), CoreError> {
        let mut rows = self.rows()?;
        match rows.iter_mut().find(|i| i.id == inquiry.id) {
            Some(row) => {
                row.question = inquiry.question.clone();
                Ok(())
            }
            None => Err(CoreError::Concurrency),
        }
    }

    fn delete(&self, id: &InquiryId) -> Result<(), CoreError> {
        let mut rows = self.rows()?;
        let before = rows.len();
        rows.retain(|i| i.id != *id);
        if rows.len() == before {
            return Err(CoreError::Concurrency);
        }
        Ok(())
    }

    fn exists(&self, id: &InquiryId) -> Result<bool, CoreError> {
        Ok(self.rows()?.iter().any(|i| i.id == *id))
    }
}
