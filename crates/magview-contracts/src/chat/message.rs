use serde_json::Value;

/// Raster attachment types the pipeline accepts, as declared by the chat
/// platform's `pretty_type` field.
pub const ACCEPTED_PRETTY_TYPES: [&str; 3] = ["PNG", "JPEG", "JFIF"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub id: String,
    pub pretty_type: String,
    pub name: Option<String>,
    pub permalink_public: Option<String>,
    pub url_private: Option<String>,
}

impl FileAttachment {
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = non_empty_str(value.get("id"))?;
        Some(Self {
            id,
            pretty_type: non_empty_str(value.get("pretty_type")).unwrap_or_default(),
            name: non_empty_str(value.get("name")),
            permalink_public: non_empty_str(value.get("permalink_public")),
            url_private: non_empty_str(value.get("url_private")),
        })
    }

    pub fn is_accepted_raster(&self) -> bool {
        ACCEPTED_PRETTY_TYPES
            .iter()
            .any(|accepted| *accepted == self.pretty_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatMessage {
    pub text: Option<String>,
    pub files: Vec<FileAttachment>,
}

impl ChatMessage {
    pub fn from_value(value: &Value) -> Self {
        let text = non_empty_str(value.get("text"));
        let files = value
            .get("files")
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(FileAttachment::from_value).collect())
            .unwrap_or_default();
        Self { text, files }
    }

    pub fn first_file(&self) -> Option<&FileAttachment> {
        self.files.first()
    }
}

/// Identifies the source image for one pipeline run; discarded when the
/// run ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub channel: String,
    pub message_ts: String,
    pub file_id: String,
    pub pretty_type: String,
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ChatMessage, FileAttachment};

    #[test]
    fn message_without_files_has_empty_attachment_list() {
        let message = ChatMessage::from_value(&json!({"text": "hello"}));
        assert_eq!(message.text.as_deref(), Some("hello"));
        assert!(message.files.is_empty());
        assert!(message.first_file().is_none());
    }

    #[test]
    fn message_parses_first_attachment_fields() {
        let message = ChatMessage::from_value(&json!({
            "text": "look at this",
            "files": [{
                "id": "F123",
                "pretty_type": "PNG",
                "name": "chart.png",
                "permalink_public": "https://files.example.com/T1-F123-abcdef",
                "url_private": "https://files.example.com/private/chart.png",
            }],
        }));
        let file = message.first_file().expect("one attachment");
        assert_eq!(file.id, "F123");
        assert_eq!(file.pretty_type, "PNG");
        assert!(file.is_accepted_raster());
    }

    #[test]
    fn attachments_without_an_id_are_dropped() {
        let message = ChatMessage::from_value(&json!({
            "files": [{"pretty_type": "PNG"}, {"id": "F9", "pretty_type": "GIF"}],
        }));
        assert_eq!(message.files.len(), 1);
        assert_eq!(message.files[0].id, "F9");
    }

    #[test]
    fn accepted_raster_check_is_exact() {
        let accepted = ["PNG", "JPEG", "JFIF"];
        for pretty_type in accepted {
            let file = FileAttachment {
                id: "F1".to_string(),
                pretty_type: pretty_type.to_string(),
                name: None,
                permalink_public: None,
                url_private: None,
            };
            assert!(file.is_accepted_raster(), "{pretty_type} should pass");
        }
        for pretty_type in ["GIF", "PDF", "png", "Zip", ""] {
            let file = FileAttachment {
                id: "F1".to_string(),
                pretty_type: pretty_type.to_string(),
                name: None,
                permalink_public: None,
                url_private: None,
            };
            assert!(!file.is_accepted_raster(), "{pretty_type:?} should fail");
        }
    }
}
