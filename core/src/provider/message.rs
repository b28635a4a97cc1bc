use serde::{Deserialize, Serialize};

use super::payload::encode_data_url;

/// Chat message in the openai content-parts shape; other formats convert from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Reference image ready to embed in a request.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ChatMessage {
    /// Single user turn: the prompt text (when non-empty) followed by each
    /// reference image as a data URL.
    pub fn user_prompt(prompt: &str, images: &[InlineImage]) -> Self {
        let mut content = Vec::with_capacity(images.len() + 1);
        if !prompt.is_empty() {
            content.push(ContentPart::Text {
                text: prompt.to_string(),
            });
        }
        content.extend(images.iter().map(|img| ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: encode_data_url(&img.mime_type, &img.bytes),
            },
        }));
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_prompt_wire_shape() {
        let msg = ChatMessage::user_prompt(
            "a cat",
            &[InlineImage {
                mime_type: "image/png".into(),
                bytes: vec![1, 2, 3],
            }],
        );
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": "a cat"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AQID"}}
                ]
            })
        );
    }

    #[test]
    fn test_empty_prompt_has_no_text_part() {
        let msg = ChatMessage::user_prompt("", &[]);
        assert!(msg.content.is_empty());
    }
}
