//! Attachments — immutable blobs referenced from message payloads by id.
//!
//! Events never embed bytes; expansion to inline content is a boundary
//! concern (REST download, MCP bridge).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// A stored blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub content_type: String,
    /// Raw bytes. Base64 on the wire, binary internally.
    #[serde(with = "bytes_as_base64")]
    pub content: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
}

impl Attachment {
    /// Inline representation: UTF-8 text passes through unchanged, binary
    /// content becomes base64.
    pub fn content_as_text(&self) -> String {
        match std::str::from_utf8(&self.content) {
            Ok(s) => s.to_owned(),
            Err(_) => BASE64.encode(&self.content),
        }
    }
}

/// Reference to an attachment from a message payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub id: String,
    pub name: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

mod bytes_as_base64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn att(content: &[u8], content_type: &str) -> Attachment {
        Attachment {
            id: "att_1".into(),
            name: "f".into(),
            content_type: content_type.into(),
            content: content.to_vec(),
            summary: None,
            doc_id: None,
        }
    }

    #[test]
    fn serde_round_trips_binary_content() {
        let a = att(&[0u8, 159, 146, 150], "application/octet-stream");
        let json = serde_json::to_string(&a).unwrap();
        let back: Attachment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn content_as_text_passes_utf8_through() {
        let a = att(b"hello world", "text/plain");
        assert_eq!(a.content_as_text(), "hello world");
    }

    #[test]
    fn content_as_text_base64s_binary() {
        let a = att(&[0xff, 0xfe], "application/octet-stream");
        assert_eq!(a.content_as_text(), "//4=");
    }
}
