//! CLI output envelope and status mapping.

use serde::Serialize;

pub const STATUS_OK: i32 = 200;
pub const STATUS_DESTINATION: i32 = 404;
pub const STATUS_INTERNAL: i32 = 500;
pub const STATUS_SERVICE: i32 = 503;
pub const STATUS_TIMEOUT: i32 = 504;

pub const MSG_DOWNLOAD_SUCCESS: &str = "Download complete";
pub const MSG_META_INFO: &str = "Metadata";
pub const MSG_GENERAL_ERR: &str = "Something went wrong";

/// Result envelope printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct Out {
    pub status: i32,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Out {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: String::new(),
            data: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Render either the JSON envelope or the plain message form.
    pub fn render(&self, json: bool) -> String {
        if json {
            serde_json::to_string_pretty(self)
                .unwrap_or_else(|_| format!(r#"{{"status":{},"message":"{}"}}"#, self.status, self.message))
        } else {
            let mut line = self.message.clone();
            if !self.details.is_empty() {
                line.push_str(": ");
                line.push_str(&self.details);
            }
            if let Some(data) = &self.data {
                line.push('\n');
                line.push_str(&serde_json::to_string_pretty(data).unwrap_or_default());
            }
            line
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_envelope_skips_empty_fields() {
        let out = Out::new(STATUS_OK, MSG_DOWNLOAD_SUCCESS);
        let rendered = out.render(true);
        assert!(rendered.contains("\"status\": 200"));
        assert!(!rendered.contains("details"));
        assert!(!rendered.contains("data"));
    }

    #[test]
    fn plain_form_appends_details() {
        let out = Out::new(STATUS_SERVICE, "Failed getting metadata").with_details("boom");
        assert_eq!(out.render(false), "Failed getting metadata: boom");
    }
}
