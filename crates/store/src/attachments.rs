//! Content-addressed attachment store.
//!
//! Ids are opaque (`att_<uuid>`). Identical content under the same name
//! and content type returns the existing id; callers must not rely on
//! that — it is an internal storage economy, not API contract.

use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use parley_domain::{Attachment, Error, Result};

use crate::db::Db;

/// Input to [`AttachmentStore::put`] — everything but the assigned id.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub name: String,
    pub content_type: String,
    pub content: Vec<u8>,
    pub summary: Option<String>,
    pub doc_id: Option<String>,
}

#[derive(Clone)]
pub struct AttachmentStore {
    db: Db,
}

impl AttachmentStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Store a blob and return its id.
    pub fn put(&self, att: NewAttachment) -> Result<String> {
        let hash = hex::encode(Sha256::digest(&att.content));
        let conn = self.db.conn();

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM attachments
                 WHERE content_hash = ?1 AND name = ?2 AND content_type = ?3",
                params![hash, att.name, att.content_type],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::db)?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let id = format!("att_{}", Uuid::new_v4());
        conn.execute(
            "INSERT INTO attachments (id, name, content_type, content, summary, doc_id, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, att.name, att.content_type, att.content, att.summary, att.doc_id, hash],
        )
        .map_err(Error::db)?;
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Option<Attachment>> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT id, name, content_type, content, summary, doc_id
             FROM attachments WHERE id = ?1",
            params![id],
            |row| {
                Ok(Attachment {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    content_type: row.get(2)?,
                    content: row.get(3)?,
                    summary: row.get(4)?,
                    doc_id: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(Error::db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AttachmentStore {
        AttachmentStore::new(Db::open_in_memory().unwrap())
    }

    fn new_att(name: &str, content: &[u8]) -> NewAttachment {
        NewAttachment {
            name: name.into(),
            content_type: "text/plain".into(),
            content: content.to_vec(),
            summary: None,
            doc_id: None,
        }
    }

    #[test]
    fn put_then_get() {
        let s = store();
        let id = s.put(new_att("notes.txt", b"hello")).unwrap();
        assert!(id.starts_with("att_"));
        let att = s.get(&id).unwrap().unwrap();
        assert_eq!(att.name, "notes.txt");
        assert_eq!(att.content, b"hello");
    }

    #[test]
    fn identical_content_dedupes() {
        let s = store();
        let id1 = s.put(new_att("a.txt", b"same")).unwrap();
        let id2 = s.put(new_att("a.txt", b"same")).unwrap();
        assert_eq!(id1, id2);
        // Different name: new id even with the same bytes.
        let id3 = s.put(new_att("b.txt", b"same")).unwrap();
        assert_ne!(id1, id3);
    }

    #[test]
    fn get_unknown_is_none() {
        assert!(store().get("att_missing").unwrap().is_none());
    }
}
