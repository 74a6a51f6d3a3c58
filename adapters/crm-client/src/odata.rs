//! Translation between the domain CRM entity model and Dataverse Web API
//! (OData v4) JSON payloads.

use domain::{AttributeValue, ColumnSet, Entity, EntityReference};
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::CrmError;

const LOOKUP_LOGICAL_NAME: &str = "@Microsoft.Dynamics.CRM.lookuplogicalname";

/// Entity set (collection) name for a logical name, following the default
/// Dataverse pluralisation: `contact` → `contacts`, `stu7_inquiry` →
/// `stu7_inquiries`, `address` → `addresses`.
pub fn entity_set_name(logical_name: &str) -> String {
    let lower = logical_name.to_ascii_lowercase();
    if let Some(stem) = lower.strip_suffix('y') {
        let before = stem.chars().last();
        if before.is_some_and(|c| !"aeiou".contains(c)) {
            return format!("{stem}ies");
        }
    }
    if ["s", "x", "z", "ch", "sh"].iter().any(|s| lower.ends_with(s)) {
        return format!("{lower}es");
    }
    format!("{lower}s")
}

/// Primary key attribute of an entity (`{logical}id`).
pub fn primary_key_field(logical_name: &str) -> String {
    format!("{}id", logical_name.to_ascii_lowercase())
}

/// Relative path addressing one record: `stu7_inquiries(<id>)`.
pub fn record_path(logical_name: &str, id: Uuid) -> String {
    format!("{}({})", entity_set_name(logical_name), id)
}

/// `$select` value for a column set; `None` means all columns.
pub fn select_clause(columns: &ColumnSet) -> Option<String> {
    match columns {
        ColumnSet::All => None,
        ColumnSet::Columns(cols) => Some(cols.join(",")),
    }
}

fn write_attributes(entity: &Entity, body: &mut Map<String, Value>) {
    for (name, value) in entity.attributes() {
        match value {
            AttributeValue::Text(s) => {
                body.insert(name.to_string(), Value::String(s.clone()));
            }
            AttributeValue::Reference(r) => {
                body.insert(
                    format!("{name}@odata.bind"),
                    Value::String(format!("/{}", record_path(&r.logical_name, r.id))),
                );
            }
            AttributeValue::Null => {
                body.insert(name.to_string(), Value::Null);
            }
        }
    }
}

/// Body for `POST {set}`. Carries the primary key so the CRM record shares
/// the caller's id.
pub fn create_body(entity: &Entity) -> Value {
    let mut body = Map::new();
    if !entity.id.is_nil() {
        body.insert(
            primary_key_field(&entity.logical_name),
            Value::String(entity.id.to_string()),
        );
    }
    write_attributes(entity, &mut body);
    Value::Object(body)
}

/// Body for `PATCH {set}({id})`.
pub fn update_body(entity: &Entity) -> Value {
    let mut body = Map::new();
    write_attributes(entity, &mut body);
    Value::Object(body)
}

/// Build an entity from a retrieve response. Annotations are dropped, lookup
/// values (`_{field}_value`) become references.
pub fn entity_from_json(logical_name: &str, id: Uuid, body: &Value) -> Result<Entity, CrmError> {
    let obj = body
        .as_object()
        .ok_or_else(|| CrmError::Decode("record is not a JSON object".into()))?;
    let pk = primary_key_field(logical_name);
    let mut entity = Entity::new(logical_name, id);

    for (key, value) in obj {
        if key.contains('@') || *key == pk {
            continue;
        }
        if let Some(field) = key.strip_prefix('_').and_then(|k| k.strip_suffix("_value")) {
            let target = obj
                .get(&format!("{key}{LOOKUP_LOGICAL_NAME}"))
                .and_then(Value::as_str)
                .unwrap_or(field);
            let attr = match value {
                Value::String(s) => {
                    let rid = Uuid::parse_str(s)
                        .map_err(|_| CrmError::Decode(format!("lookup {field} is not a guid")))?;
                    AttributeValue::Reference(EntityReference::new(target, rid))
                }
                _ => AttributeValue::Null,
            };
            entity.set(field, attr);
            continue;
        }
        let attr = match value {
            Value::Null => AttributeValue::Null,
            Value::String(s) => AttributeValue::Text(s.clone()),
            other => AttributeValue::Text(other.to_string()),
        };
        entity.set(key.as_str(), attr);
    }
    Ok(entity)
}

/// Pull the record id out of an `OData-EntityId` header value such as
/// `https://org.crm.dynamics.com/api/data/v9.2/stu7_inquiries(<guid>)`.
pub fn id_from_entity_uri(uri: &str) -> Option<Uuid> {
    let open = uri.rfind('(')?;
    let close = uri[open..].find(')')? + open;
    Uuid::parse_str(&uri[open + 1..close]).ok()
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Map a non-success response onto `CrmError`.
pub fn decode_error(status: u16, body: &str) -> CrmError {
    let parsed: Option<ErrorBody> = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);
    let (code, message) = match parsed {
        Some(e) => (e.code, e.message.unwrap_or_default()),
        None => (None, body.chars().take(200).collect()),
    };
    if status == 404 {
        return CrmError::NotFound(message);
    }
    CrmError::Api {
        status,
        code,
        message,
    }
}
