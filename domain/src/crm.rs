//! Generic CRM record model plus the inquiry mapping.
//!
//! The CRM speaks in loosely typed entities: a logical name, an id and a bag
//! of named attributes. Adapters translate this model to their wire format.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::{CurrentUser, Inquiry};

/// Logical name of the mirrored inquiry entity.
pub const INQUIRY_ENTITY: &str = "stu7_inquiry";
/// Logical name of the CRM contact entity.
pub const CONTACT_ENTITY: &str = "contact";

pub const FIELD_NAME: &str = "stu7_name";
pub const FIELD_QUESTION: &str = "stu7_question";
pub const FIELD_RESPONSE: &str = "stu7_response";
pub const FIELD_CONTACT: &str = "stu7_contact";

/// Pointer to another CRM record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityReference {
    pub logical_name: String,
    pub id: Uuid,
}

impl EntityReference {
    pub fn new(logical_name: impl Into<String>, id: Uuid) -> Self {
        Self {
            logical_name: logical_name.into(),
            id,
        }
    }
}

/// Attribute value kinds the service reads or writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeValue {
    Text(String),
    Reference(EntityReference),
    Null,
}

/// A CRM record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entity {
    pub logical_name: String,
    pub id: Uuid,
    attributes: BTreeMap<String, AttributeValue>,
}

impl Entity {
    pub fn new(logical_name: impl Into<String>, id: Uuid) -> Self {
        Self {
            logical_name: logical_name.into(),
            id,
            attributes: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.attributes.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Text value of an attribute; `None` when absent, null or not text.
    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.attributes.get(name) {
            Some(AttributeValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_reference(&self, name: &str) -> Option<&EntityReference> {
        match self.attributes.get(name) {
            Some(AttributeValue::Reference(r)) => Some(r),
            _ => None,
        }
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy of this entity restricted to the given columns.
    pub fn project(&self, columns: &ColumnSet) -> Entity {
        let mut out = Entity::new(self.logical_name.clone(), self.id);
        for (name, value) in self.attributes() {
            if columns.includes(name) {
                out.set(name, value.clone());
            }
        }
        out
    }
}

/// Which attributes a retrieve should return.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnSet {
    All,
    Columns(Vec<String>),
}

impl ColumnSet {
    pub fn of(names: &[&str]) -> Self {
        ColumnSet::Columns(names.iter().map(|n| n.to_string()).collect())
    }

    pub fn includes(&self, name: &str) -> bool {
        match self {
            ColumnSet::All => true,
            ColumnSet::Columns(cols) => cols.iter().any(|c| c == name),
        }
    }
}

/// Build the CRM record mirroring a freshly created inquiry.
pub fn inquiry_to_entity(inquiry: &Inquiry, creator: &CurrentUser) -> Entity {
    Entity::new(INQUIRY_ENTITY, inquiry.id.as_uuid())
        .with(FIELD_NAME, AttributeValue::Text(creator.user_name.clone()))
        .with(FIELD_QUESTION, AttributeValue::Text(inquiry.question.clone()))
        .with(
            FIELD_CONTACT,
            AttributeValue::Reference(EntityReference::new(
                CONTACT_ENTITY,
                inquiry.contact_id.as_uuid(),
            )),
        )
}

/// Columns fetched to enrich a local inquiry.
pub fn response_columns() -> ColumnSet {
    ColumnSet::of(&[FIELD_RESPONSE])
}
