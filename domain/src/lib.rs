//! Domain library for the Inquiries service.
//!
//! Holds the inquiry types, the CRM record model, the ports (traits) the
//! adapters implement, and the error type shared across them. Keep HTTP and
//! storage concerns out of this crate.

use std::fmt::{Display, Formatter};
use std::future::Future;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod crm;

pub use crm::{AttributeValue, ColumnSet, Entity, EntityReference};

/// Identifier of an inquiry. Shared verbatim with the mirrored CRM record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InquiryId(Uuid);

impl InquiryId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Parse a textual id (hyphenated, simple or braced UUID forms).
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| CoreError::InvalidId(s.to_string()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for InquiryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the CRM contact behind an authenticated user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(Uuid);

impl ContactId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| CoreError::InvalidId(s.to_string()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The authenticated caller as the domain sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CurrentUser {
    pub contact_id: ContactId,
    /// Login/display name, written to the CRM record name.
    pub user_name: String,
}

/// Stored inquiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inquiry {
    pub id: InquiryId,
    pub question: String,
    /// Answer maintained in the CRM. Only populated on views that fetch it;
    /// the local store never holds it.
    pub response: Option<String>,
    /// Owner. Immutable after creation.
    pub contact_id: ContactId,
    /// Secondary owner reference (the creator's login name).
    pub user_id: Option<String>,
}

impl Inquiry {
    pub fn is_owned_by(&self, user: &CurrentUser) -> bool {
        self.contact_id == user.contact_id
    }
}

/// Input data for creating a new inquiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewInquiry {
    pub question: String,
}

/// Submitted edit of an existing inquiry. `id` is the id carried in the
/// payload; it must match the id the request addressed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InquiryEdit {
    pub id: InquiryId,
    pub question: String,
}

/// Id generator interface so tests can pin identifiers.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> InquiryId;
}

/// Random (v4) identifiers.
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidV4Generator;

impl IdGenerator for UuidV4Generator {
    fn next_id(&self) -> InquiryId {
        InquiryId(Uuid::new_v4())
    }
}

/// Repository port for the local inquiry table.
pub trait InquiryRepository: Send + Sync {
    fn get(&self, id: &InquiryId) -> Result<Option<Inquiry>, CoreError>;
    /// Insert a new row. `AlreadyExists` on duplicate id.
    fn insert(&self, inquiry: &Inquiry) -> Result<(), CoreError>;
    /// All inquiries owned by `contact`, in insertion order.
    fn list_by_contact(&self, contact: &ContactId) -> Result<Vec<Inquiry>, CoreError>;
    /// Persist the mutable columns (the question). `Concurrency` when no row
    /// was affected.
    fn update(&self, inquiry: &Inquiry) -> Result<(), CoreError>;
    /// Remove a row. `Concurrency` when no row was affected.
    fn delete(&self, id: &InquiryId) -> Result<(), CoreError>;
    fn exists(&self, id: &InquiryId) -> Result<bool, CoreError>;
}

/// Port for the external CRM holding the mirrored inquiry records.
pub trait CrmService: Send + Sync {
    fn retrieve(
        &self,
        logical_name: &str,
        id: Uuid,
        columns: &ColumnSet,
    ) -> impl Future<Output = Result<Entity, CoreError>> + Send;

    /// Create a record and return the id the CRM assigned (the entity's own id
    /// when it carries one).
    fn create(&self, entity: &Entity) -> impl Future<Output = Result<Uuid, CoreError>> + Send;

    fn update(&self, entity: &Entity) -> impl Future<Output = Result<(), CoreError>> + Send;

    fn delete(&self, logical_name: &str, id: Uuid)
        -> impl Future<Output = Result<(), CoreError>> + Send;
}

/// Core domain errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("invalid identifier: {0}")]
    InvalidId(String),
    #[error("not found")]
    NotFound,
    #[error("resource already exists")]
    AlreadyExists,
    #[error("record was modified or removed concurrently")]
    Concurrency,
    #[error("repository error: {0}")]
    Repository(String),
    #[error("crm error: {0}")]
    Crm(String),
}

/// Return a short about/version line for startup logs.
pub fn about() -> String {
    let pkg = env!("CARGO_PKG_NAME");
    let ver = env!("CARGO_PKG_VERSION");
    format!("{} v{}", pkg, ver)
}

pub mod adapters;
pub mod service;
pub mod validate;
