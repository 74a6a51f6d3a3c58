use tracing::warn;

use crate::crm::{self, AttributeValue, Entity, INQUIRY_ENTITY};
use crate::validate::validate_question;
use crate::{
    CoreError, CrmService, CurrentUser, IdGenerator, Inquiry, InquiryEdit, InquiryId,
    InquiryRepository, NewInquiry,
};

/// Application service orchestrating the local store and the CRM mirror.
///
/// Every write touches both systems in a fixed order without a surrounding
/// transaction; a failure half way leaves the stores disagreeing and is only
/// logged. Records owned by another contact are reported as `NotFound`.
pub struct InquiryService<R: InquiryRepository, C: CrmService, G: IdGenerator> {
    repo: R,
    crm: C,
    ids: G,
}

impl<R: InquiryRepository, C: CrmService, G: IdGenerator> InquiryService<R, C, G> {
    pub fn new(repo: R, crm: C, ids: G) -> Self {
        Self { repo, crm, ids }
    }

    /// All inquiries of the caller. Local store only.
    pub fn list(&self, user: &CurrentUser) -> Result<Vec<Inquiry>, CoreError> {
        self.repo.list_by_contact(&user.contact_id)
    }

    /// Load an owned inquiry from the local store without CRM enrichment.
    pub fn find(&self, id: &InquiryId, user: &CurrentUser) -> Result<Inquiry, CoreError> {
        match self.repo.get(id)? {
            Some(inquiry) if inquiry.is_owned_by(user) => Ok(inquiry),
            _ => Err(CoreError::NotFound),
        }
    }

    /// Load an owned inquiry and overlay the response held by the CRM.
    pub async fn details(&self, id: &InquiryId, user: &CurrentUser) -> Result<Inquiry, CoreError> {
        let mut inquiry = self.find(id, user)?;
        let remote = self
            .crm
            .retrieve(INQUIRY_ENTITY, id.as_uuid(), &crm::response_columns())
            .await?;
        inquiry.response = remote.get_text(crm::FIELD_RESPONSE).map(str::to_string);
        Ok(inquiry)
    }

    /// Create an inquiry for the caller and mirror it to the CRM.
    pub async fn create(&self, input: NewInquiry, user: &CurrentUser) -> Result<Inquiry, CoreError> {
        validate_question(&input.question)?;

        let inquiry = Inquiry {
            id: self.ids.next_id(),
            question: input.question,
            response: None,
            contact_id: user.contact_id,
            user_id: Some(user.user_name.clone()),
        };
        self.repo.insert(&inquiry)?;

        let entity = crm::inquiry_to_entity(&inquiry, user);
        if let Err(e) = self.crm.create(&entity).await {
            warn!(id = %inquiry.id, err = %e, "inquiry stored locally but crm create failed");
            return Err(e);
        }
        Ok(inquiry)
    }

    /// Apply an edit: CRM first, local commit last.
    pub async fn edit(
        &self,
        route_id: &InquiryId,
        input: InquiryEdit,
        user: &CurrentUser,
    ) -> Result<Inquiry, CoreError> {
        if *route_id != input.id {
            return Err(CoreError::NotFound);
        }
        validate_question(&input.question)?;

        let mut inquiry = self.find(route_id, user)?;
        inquiry.question = input.question;

        let remote = self
            .crm
            .retrieve(INQUIRY_ENTITY, route_id.as_uuid(), &crm::response_columns())
            .await?;
        // The response belongs to the CRM; the patch carries the question only.
        let patch = Entity::new(INQUIRY_ENTITY, remote.id).with(
            crm::FIELD_QUESTION,
            AttributeValue::Text(inquiry.question.clone()),
        );
        self.crm.update(&patch).await?;

        match self.repo.update(&inquiry) {
            Ok(()) => Ok(inquiry),
            Err(CoreError::Concurrency) => {
                warn!(id = %route_id, "crm updated but local commit hit a concurrency conflict");
                self.resolve_conflict(route_id)
            }
            Err(e) => {
                warn!(id = %route_id, err = %e, "crm updated but local commit failed");
                Err(e)
            }
        }
    }

    /// Delete an owned inquiry locally, then in the CRM.
    pub async fn delete(&self, id: &InquiryId, user: &CurrentUser) -> Result<(), CoreError> {
        self.find(id, user)?;

        match self.repo.delete(id) {
            Ok(()) => {}
            Err(CoreError::Concurrency) => return self.resolve_conflict(id).map(|_| ()),
            Err(e) => return Err(e),
        }

        if let Err(e) = self.crm.delete(INQUIRY_ENTITY, id.as_uuid()).await {
            warn!(id = %id, err = %e, "inquiry deleted locally but crm delete failed");
            return Err(e);
        }
        Ok(())
    }

    // A vanished row means someone deleted it underneath us; anything else is
    // a genuine conflict and goes back to the caller unchanged.
    fn resolve_conflict(&self, id: &InquiryId) -> Result<Inquiry, CoreError> {
        if self.repo.exists(id)? {
            Err(CoreError::Concurrency)
        } else {
            Err(CoreError::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_crm::InMemoryCrm;
    use crate::adapters::memory_repo::InMemoryInquiryRepo;
    use crate::crm::{ColumnSet, FIELD_CONTACT, FIELD_NAME, FIELD_QUESTION, FIELD_RESPONSE};
    use crate::{ContactId, UuidV4Generator};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    fn user(name: &str) -> CurrentUser {
        CurrentUser {
            contact_id: ContactId::new(Uuid::new_v4()),
            user_name: name.into(),
        }
    }

    /// Shares one CRM between the service and the test.
    struct SharedCrm(Arc<InMemoryCrm>);

    impl CrmService for SharedCrm {
        async fn retrieve(
            &self,
            logical_name: &str,
            id: Uuid,
            columns: &ColumnSet,
        ) -> Result<Entity, CoreError> {
            self.0.retrieve(logical_name, id, columns).await
        }
        async fn create(&self, entity: &Entity) -> Result<Uuid, CoreError> {
            self.0.create(entity).await
        }
        async fn update(&self, entity: &Entity) -> Result<(), CoreError> {
            self.0.update(entity).await
        }
        async fn delete(&self, logical_name: &str, id: Uuid) -> Result<(), CoreError> {
            self.0.delete(logical_name, id).await
        }
    }

    /// In-memory CRM that keeps a copy of every update it receives.
    struct RecordingCrm {
        inner: Arc<InMemoryCrm>,
        updates: Mutex<Vec<Entity>>,
    }

    impl CrmService for Arc<RecordingCrm> {
        async fn retrieve(
            &self,
            logical_name: &str,
            id: Uuid,
            columns: &ColumnSet,
        ) -> Result<Entity, CoreError> {
            self.inner.retrieve(logical_name, id, columns).await
        }
        async fn create(&self, entity: &Entity) -> Result<Uuid, CoreError> {
            self.inner.create(entity).await
        }
        async fn update(&self, entity: &Entity) -> Result<(), CoreError> {
            self.updates.lock().unwrap().push(entity.clone());
            self.inner.update(entity).await
        }
        async fn delete(&self, logical_name: &str, id: Uuid) -> Result<(), CoreError> {
            self.inner.delete(logical_name, id).await
        }
    }

    /// CRM that counts calls and can be told to fail.
    #[derive(Default)]
    struct ScriptedCrm {
        calls: AtomicUsize,
        fail_create: AtomicBool,
        fail_delete: AtomicBool,
    }

    impl CrmService for Arc<ScriptedCrm> {
        async fn retrieve(
            &self,
            logical_name: &str,
            id: Uuid,
            _columns: &ColumnSet,
        ) -> Result<Entity, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Entity::new(logical_name, id))
        }
        async fn create(&self, entity: &Entity) -> Result<Uuid, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(CoreError::Crm("unavailable".into()));
            }
            Ok(entity.id)
        }
        async fn update(&self, _entity: &Entity) -> Result<(), CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn delete(&self, _logical_name: &str, _id: Uuid) -> Result<(), CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(CoreError::Crm("unavailable".into()));
            }
            Ok(())
        }
    }

    /// Repository whose updates and deletes always report a conflict,
    /// optionally after removing the row.
    struct ConflictingRepo {
        inner: InMemoryInquiryRepo,
        vanish: bool,
    }

    impl InquiryRepository for ConflictingRepo {
        fn get(&self, id: &InquiryId) -> Result<Option<Inquiry>, CoreError> {
            self.inner.get(id)
        }
        fn insert(&self, inquiry: &Inquiry) -> Result<(), CoreError> {
            self.inner.insert(inquiry)
        }
        fn list_by_contact(&self, contact: &ContactId) -> Result<Vec<Inquiry>, CoreError> {
            self.inner.list_by_contact(contact)
        }
        fn update(&self, inquiry: &Inquiry) -> Result<(), CoreError> {
            if self.vanish {
                self.inner.delete(&inquiry.id)?;
            }
            Err(CoreError::Concurrency)
        }
        fn delete(&self, id: &InquiryId) -> Result<(), CoreError> {
            if self.vanish {
                self.inner.delete(id)?;
            }
            Err(CoreError::Concurrency)
        }
        fn exists(&self, id: &InquiryId) -> Result<bool, CoreError> {
            self.inner.exists(id)
        }
    }

    fn shared_service() -> (
        InquiryService<InMemoryInquiryRepo, SharedCrm, UuidV4Generator>,
        Arc<InMemoryCrm>,
    ) {
        let crm = Arc::new(InMemoryCrm::new());
        let svc = InquiryService::new(
            InMemoryInquiryRepo::new(),
            SharedCrm(crm.clone()),
            UuidV4Generator,
        );
        (svc, crm)
    }

    fn new_inquiry(q: &str) -> NewInquiry {
        NewInquiry { question: q.into() }
    }

    #[tokio::test]
    async fn list_returns_only_callers_inquiries() {
        let (svc, _crm) = shared_service();
        let ada = user("ada");
        let bob = user("bob");
        svc.create(new_inquiry("ada 1"), &ada).await.unwrap();
        svc.create(new_inquiry("bob 1"), &bob).await.unwrap();
        svc.create(new_inquiry("ada 2"), &ada).await.unwrap();

        let mine = svc.list(&ada).unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|i| i.contact_id == ada.contact_id));
    }

    #[tokio::test]
    async fn create_assigns_id_owner_and_mirrors_to_crm() {
        let (svc, crm) = shared_service();
        let ada = user("ada@contoso.com");
        let a = svc.create(new_inquiry("first?"), &ada).await.unwrap();
        let b = svc.create(new_inquiry("second?"), &ada).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.contact_id, ada.contact_id);
        assert_eq!(a.user_id.as_deref(), Some("ada@contoso.com"));

        let remote = crm.get(INQUIRY_ENTITY, a.id.as_uuid()).expect("mirrored");
        assert_eq!(remote.get_text(FIELD_QUESTION), Some("first?"));
        assert_eq!(remote.get_text(FIELD_NAME), Some("ada@contoso.com"));
        assert_eq!(
            remote.get_reference(FIELD_CONTACT).map(|r| r.id),
            Some(ada.contact_id.as_uuid())
        );
    }

    #[tokio::test]
    async fn create_rejects_invalid_question_without_side_effects() {
        let (svc, crm) = shared_service();
        let ada = user("ada");
        let err = svc.create(new_inquiry("  "), &ada).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        assert!(svc.list(&ada).unwrap().is_empty());
        assert!(crm.is_empty());
    }

    #[tokio::test]
    async fn create_keeps_local_row_when_crm_fails() {
        let crm = Arc::new(ScriptedCrm::default());
        crm.fail_create.store(true, Ordering::SeqCst);
        let svc = InquiryService::new(InMemoryInquiryRepo::new(), crm.clone(), UuidV4Generator);
        let ada = user("ada");
        let err = svc.create(new_inquiry("q"), &ada).await.unwrap_err();
        assert!(matches!(err, CoreError::Crm(_)));
        assert_eq!(svc.list(&ada).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn details_overlays_crm_response() {
        let (svc, crm) = shared_service();
        let ada = user("ada");
        let created = svc.create(new_inquiry("q"), &ada).await.unwrap();
        crm.set_text(INQUIRY_ENTITY, created.id.as_uuid(), FIELD_RESPONSE, "answer")
            .unwrap();

        let got = svc.details(&created.id, &ada).await.unwrap();
        assert_eq!(got.response.as_deref(), Some("answer"));
        // The local store stays without a response.
        assert_eq!(svc.find(&created.id, &ada).unwrap().response, None);
    }

    #[tokio::test]
    async fn details_of_unknown_or_foreign_id_is_not_found_without_crm_call() {
        let crm = Arc::new(ScriptedCrm::default());
        let svc = InquiryService::new(InMemoryInquiryRepo::new(), crm.clone(), UuidV4Generator);
        let ada = user("ada");
        let created = svc.create(new_inquiry("q"), &ada).await.unwrap();
        let calls = crm.calls.load(Ordering::SeqCst);

        let missing = InquiryId::new(Uuid::new_v4());
        assert!(matches!(
            svc.details(&missing, &ada).await,
            Err(CoreError::NotFound)
        ));
        assert!(matches!(
            svc.details(&created.id, &user("eve")).await,
            Err(CoreError::NotFound)
        ));
        assert_eq!(crm.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn edit_updates_both_stores() {
        let (svc, crm) = shared_service();
        let ada = user("ada");
        let created = svc.create(new_inquiry("old"), &ada).await.unwrap();
        crm.set_text(INQUIRY_ENTITY, created.id.as_uuid(), FIELD_RESPONSE, "kept")
            .unwrap();

        let edit = InquiryEdit {
            id: created.id,
            question: "new".into(),
        };
        let edited = svc.edit(&created.id, edit, &ada).await.unwrap();
        assert_eq!(edited.question, "new");
        assert_eq!(edited.contact_id, ada.contact_id);

        assert_eq!(svc.find(&created.id, &ada).unwrap().question, "new");
        let remote = crm.get(INQUIRY_ENTITY, created.id.as_uuid()).unwrap();
        assert_eq!(remote.get_text(FIELD_QUESTION), Some("new"));
        assert_eq!(remote.get_text(FIELD_RESPONSE), Some("kept"));
    }

    #[tokio::test]
    async fn edit_patches_question_without_response() {
        let crm = Arc::new(RecordingCrm {
            inner: Arc::new(InMemoryCrm::new()),
            updates: Mutex::new(Vec::new()),
        });
        let svc = InquiryService::new(InMemoryInquiryRepo::new(), crm.clone(), UuidV4Generator);
        let ada = user("ada");
        let created = svc.create(new_inquiry("q1"), &ada).await.unwrap();
        crm.inner
            .set_text(INQUIRY_ENTITY, created.id.as_uuid(), FIELD_RESPONSE, "agent answer")
            .unwrap();

        let edit = InquiryEdit {
            id: created.id,
            question: "q2".into(),
        };
        svc.edit(&created.id, edit, &ada).await.unwrap();

        let updates = crm.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        let pushed = &updates[0];
        assert_eq!(pushed.id, created.id.as_uuid());
        assert_eq!(pushed.get_text(FIELD_QUESTION), Some("q2"));
        assert!(pushed.get(FIELD_RESPONSE).is_none());
        assert_eq!(pushed.attributes().count(), 1);

        let remote = crm.inner.get(INQUIRY_ENTITY, created.id.as_uuid()).unwrap();
        assert_eq!(remote.get_text(FIELD_RESPONSE), Some("agent answer"));
    }

    #[tokio::test]
    async fn edit_with_mismatched_id_touches_nothing() {
        let crm = Arc::new(ScriptedCrm::default());
        let svc = InquiryService::new(InMemoryInquiryRepo::new(), crm.clone(), UuidV4Generator);
        let ada = user("ada");
        let created = svc.create(new_inquiry("old"), &ada).await.unwrap();
        let calls = crm.calls.load(Ordering::SeqCst);

        let edit = InquiryEdit {
            id: InquiryId::new(Uuid::new_v4()),
            question: "new".into(),
        };
        let err = svc.edit(&created.id, edit, &ada).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound));
        assert_eq!(crm.calls.load(Ordering::SeqCst), calls);
        assert_eq!(svc.find(&created.id, &ada).unwrap().question, "old");
    }

    #[tokio::test]
    async fn edit_conflict_on_deleted_row_is_not_found() {
        let repo = ConflictingRepo {
            inner: InMemoryInquiryRepo::new(),
            vanish: true,
        };
        let svc = InquiryService::new(repo, Arc::new(ScriptedCrm::default()), UuidV4Generator);
        let ada = user("ada");
        let created = svc.create(new_inquiry("old"), &ada).await.unwrap();
        let edit = InquiryEdit {
            id: created.id,
            question: "new".into(),
        };
        let err = svc.edit(&created.id, edit, &ada).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound));
    }

    #[tokio::test]
    async fn edit_conflict_on_existing_row_is_reraised() {
        let repo = ConflictingRepo {
            inner: InMemoryInquiryRepo::new(),
            vanish: false,
        };
        let svc = InquiryService::new(repo, Arc::new(ScriptedCrm::default()), UuidV4Generator);
        let ada = user("ada");
        let created = svc.create(new_inquiry("old"), &ada).await.unwrap();
        let edit = InquiryEdit {
            id: created.id,
            question: "new".into(),
        };
        let err = svc.edit(&created.id, edit, &ada).await.unwrap_err();
        assert!(matches!(err, CoreError::Concurrency));
    }

    #[tokio::test]
    async fn delete_removes_from_both_stores() {
        let (svc, crm) = shared_service();
        let ada = user("ada");
        let created = svc.create(new_inquiry("bye"), &ada).await.unwrap();
        svc.delete(&created.id, &ada).await.unwrap();
        assert!(svc.list(&ada).unwrap().is_empty());
        assert!(crm.get(INQUIRY_ENTITY, created.id.as_uuid()).is_none());
        assert!(matches!(
            svc.delete(&created.id, &ada).await,
            Err(CoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn delete_conflict_on_deleted_row_is_not_found() {
        let repo = ConflictingRepo {
            inner: InMemoryInquiryRepo::new(),
            vanish: true,
        };
        let crm = Arc::new(ScriptedCrm::default());
        let svc = InquiryService::new(repo, crm.clone(), UuidV4Generator);
        let ada = user("ada");
        let created = svc.create(new_inquiry("bye"), &ada).await.unwrap();
        let calls = crm.calls.load(Ordering::SeqCst);

        let err = svc.delete(&created.id, &ada).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound));
        assert_eq!(crm.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn delete_conflict_on_existing_row_is_reraised() {
        let repo = ConflictingRepo {
            inner: InMemoryInquiryRepo::new(),
            vanish: false,
        };
        let crm = Arc::new(ScriptedCrm::default());
        let svc = InquiryService::new(repo, crm.clone(), UuidV4Generator);
        let ada = user("ada");
        let created = svc.create(new_inquiry("stay"), &ada).await.unwrap();
        let calls = crm.calls.load(Ordering::SeqCst);

        let err = svc.delete(&created.id, &ada).await.unwrap_err();
        assert!(matches!(err, CoreError::Concurrency));
        assert_eq!(crm.calls.load(Ordering::SeqCst), calls);
        assert_eq!(svc.list(&ada).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_leaves_local_store_mutated_when_crm_fails() {
        let crm = Arc::new(ScriptedCrm::default());
        let svc = InquiryService::new(InMemoryInquiryRepo::new(), crm.clone(), UuidV4Generator);
        let ada = user("ada");
        let created = svc.create(new_inquiry("bye"), &ada).await.unwrap();
        crm.fail_delete.store(true, Ordering::SeqCst);

        let err = svc.delete(&created.id, &ada).await.unwrap_err();
        assert!(matches!(err, CoreError::Crm(_)));
        assert!(svc.list(&ada).unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_of_foreign_inquiry_is_not_found() {
        let (svc, crm) = shared_service();
        let ada = user("ada");
        let created = svc.create(new_inquiry("mine"), &ada).await.unwrap();
        let err = svc.delete(&created.id, &user("eve")).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound));
        assert_eq!(svc.list(&ada).unwrap().len(), 1);
        assert_eq!(crm.len(), 1);
    }
}
