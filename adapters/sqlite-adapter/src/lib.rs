//! sqlite-adapter: SQLite implementation of the InquiryRepository port.
//!
//! Purpose
//! - Provide the file-based local store the api-server runs against.
//! - Implements the `InquiryRepository` trait from the `domain` crate.
//!
//! Notes
//! - Uses `rusqlite` with the `bundled` feature for portability.
//! - Ids are stored as hyphenated lowercase UUID text.
//! - The CRM-owned response is not a column; it is overlaid at read time.
//! - Updates and deletes that affect no row report `CoreError::Concurrency`,
//!   the caller decides whether that means "gone" or "conflict".

use std::path::Path;

use domain::{ContactId, CoreError, Inquiry, InquiryId, InquiryRepository};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

/// SQLite-backed inquiry repository.
pub struct SqliteRepo {
    conn: std::sync::Mutex<Connection>,
}

impl SqliteRepo {
    /// Open (or create) a SQLite database at the given path and ensure schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let conn = Connection::open(path).map_err(map_sqerr)?;
        init_schema(&conn)?;
        Ok(Self { conn: std::sync::Mutex::new(conn) })
    }

    /// Private in-memory database; handy for tests and throwaway runs.
    pub fn in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqerr)?;
        init_schema(&conn)?;
        Ok(Self { conn: std::sync::Mutex::new(conn) })
    }

    /// Open the database at `path`, creating its parent directory first.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| CoreError::Repository(format!("create {}: {e}", dir.display())))?;
            }
        }
        debug!(path = %path.display(), "opening sqlite store");
        Self::new(path)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CoreError> {
        self.conn.lock().map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

fn init_schema(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS inquiries (
            inquiry_id TEXT PRIMARY KEY,
            question TEXT NOT NULL,
            contact_id TEXT NOT NULL,
            user_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_inquiries_contact ON inquiries(contact_id);
        "#
    ).map_err(map_sqerr)?;
    Ok(())
}

fn map_sqerr<E: std::fmt::Display>(e: E) -> CoreError { CoreError::Repository(format!("sqlite error: {e}")) }

const SELECT_COLUMNS: &str = "SELECT inquiry_id, question, contact_id, user_id FROM inquiries";

fn row_to_inquiry(row: &rusqlite::Row) -> Result<Inquiry, CoreError> {
    let id: String = row.get(0).map_err(map_sqerr)?;
    let question: String = row.get(1).map_err(map_sqerr)?;
    let contact: String = row.get(2).map_err(map_sqerr)?;
    let user_id: Option<String> = row.get(3).map_err(map_sqerr)?;

    let id = InquiryId::parse(&id).map_err(|e| CoreError::Repository(format!("bad inquiry_id in db: {e}")))?;
    let contact_id = ContactId::parse(&contact).map_err(|e| CoreError::Repository(format!("bad contact_id in db: {e}")))?;
    Ok(Inquiry { id, question, response: None, contact_id, user_id })
}

impl InquiryRepository for SqliteRepo {
    fn get(&self, id: &InquiryId) -> Result<Option<Inquiry>, CoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE inquiry_id = ?1")).map_err(map_sqerr)?;
        let mut rows = stmt.query(params![id.to_string()]).map_err(map_sqerr)?;
        if let Some(row) = rows.next().map_err(map_sqerr)? {
            Ok(Some(row_to_inquiry(row)?))
        } else {
            Ok(None)
        }
    }

    fn insert(&self, inquiry: &Inquiry) -> Result<(), CoreError> {
        let conn = self.lock()?;
        let res = conn.execute(
            "INSERT INTO inquiries(inquiry_id, question, contact_id, user_id) VALUES (?1, ?2, ?3, ?4)",
            params![inquiry.id.to_string(), inquiry.question, inquiry.contact_id.to_string(), inquiry.user_id],
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) => {
                if let rusqlite::Error::SqliteFailure(err, _) = &e { if err.code == rusqlite::ErrorCode::ConstraintViolation { return Err(CoreError::AlreadyExists); } }
                Err(map_sqerr(e))
            }
        }
    }

    fn list_by_contact(&self, contact: &ContactId) -> Result<Vec<Inquiry>, CoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE contact_id = ?1 ORDER BY rowid")).map_err(map_sqerr)?;
        let mut rows = stmt.query(params![contact.to_string()]).map_err(map_sqerr)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqerr)? {
            out.push(row_to_inquiry(row)?);
        }
        Ok(out)
    }

    fn update(&self, inquiry: &Inquiry) -> Result<(), CoreError> {
        let conn = self.lock()?;
        // contact_id and user_id are fixed at creation.
        let changed = conn.execute(
            "UPDATE inquiries SET question = ?1 WHERE inquiry_id = ?2",
            params![inquiry.question, inquiry.id.to_string()],
        ).map_err(map_sqerr)?;
        if changed == 0 { Err(CoreError::Concurrency) } else { Ok(()) }
    }

    fn delete(&self, id: &InquiryId) -> Result<(), CoreError> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM inquiries WHERE inquiry_id = ?1", params![id.to_string()]).map_err(map_sqerr)?;
        if changed == 0 { Err(CoreError::Concurrency) } else { Ok(()) }
    }

    fn exists(&self, id: &InquiryId) -> Result<bool, CoreError> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM inquiries WHERE inquiry_id = ?1", params![id.to_string()], |row| row.get(0))
            .optional()
            .map_err(map_sqerr)?;
        Ok(found.is_some())
    }
}
