//! MCP domain types: capabilities, tools, prompts, resources, and the
//! results returned by an initialised upstream session.
//!
//! These are the shapes exchanged with upstream MCP servers once a session
//! is established; they are independent of which transport carried them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::errors::{ProtocolError, ProtocolResult};

/// Protocol version in `YYYY-MM-DD` form, validated at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(String);

impl ProtocolVersion {
    /// Protocol version this manager speaks to upstream servers.
    pub const CURRENT: &'static str = "2025-06-18";

    pub fn new(version: impl Into<String>) -> ProtocolResult<Self> {
        let version = version.into();
        if Self::is_valid_version(&version) {
            Ok(Self(version))
        } else {
            Err(ProtocolError::InvalidProtocolVersion(version))
        }
    }

    pub fn current() -> Self {
        Self(Self::CURRENT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid_version(version: &str) -> bool {
        if version.len() != 10 {
            return false;
        }
        let chars: Vec<char> = version.chars().collect();
        chars.get(4) == Some(&'-')
            && chars.get(7) == Some(&'-')
            && chars[0..4].iter().all(|c| c.is_ascii_digit())
            && chars[5..7].iter().all(|c| c.is_ascii_digit())
            && chars[8..10].iter().all(|c| c.is_ascii_digit())
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A URI naming a resource. Upstream servers can use arbitrary custom
/// schemes (e.g. `everything://dashboard`), so validation only rejects
/// the empty/schemeless case rather than enforcing a scheme allowlist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Uri(String);

impl Uri {
    pub fn new(uri: impl Into<String>) -> ProtocolResult<Self> {
        let uri = uri.into();
        if Self::is_valid_uri(&uri) {
            Ok(Self(uri))
        } else {
            Err(ProtocolError::InvalidUri(uri))
        }
    }

    /// Build a URI without validation, for values already known to be well-formed
    /// (e.g. ones round-tripped from a deserialised upstream response).
    pub fn new_unchecked(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scheme(&self) -> Option<&str> {
        self.0.split(':').next()
    }

    fn is_valid_uri(uri: &str) -> bool {
        !uri.is_empty() && uri.contains(':') && !uri.starts_with(':')
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// MIME type in `type/subtype` form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MimeType(String);

impl MimeType {
    pub fn new(mime_type: impl Into<String>) -> ProtocolResult<Self> {
        let mime_type = mime_type.into();
        if Self::is_valid_mime_type(&mime_type) {
            Ok(Self(mime_type))
        } else {
            Err(ProtocolError::InvalidMimeType(mime_type))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid_mime_type(mime_type: &str) -> bool {
        let parts: Vec<&str> = mime_type.split('/').collect();
        parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty()
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity exchanged during the `initialize` handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Multi-modal content returned in tool calls, prompt messages, and resource reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Content {
    #[serde(rename = "text")]
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        uri: Option<Uri>,
        #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<MimeType>,
    },
    #[serde(rename = "image")]
    Image {
        /// Base64-encoded image bytes, as supplied by the upstream server.
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: MimeType,
        #[serde(skip_serializing_if = "Option::is_none")]
        uri: Option<Uri>,
    },
    #[serde(rename = "resource")]
    Resource {
        #[serde(rename = "uri")]
        resource: Uri,
        text: Option<String>,
        #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<MimeType>,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            uri: None,
            mime_type: None,
        }
    }

    pub fn text_with_uri(text: impl Into<String>, uri: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            uri: Some(Uri::new_unchecked(uri)),
            mime_type: None,
        }
    }

    /// A single-element resource content, used by the 401/OAuth `read_resource` branch.
    pub fn resource_text(uri: impl Into<String>, mime_type: &str, text: impl Into<String>) -> Self {
        Self::Resource {
            resource: Uri::new_unchecked(uri),
            text: Some(text.into()),
            mime_type: MimeType::new(mime_type).ok(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text { text, .. } => Some(text),
            Content::Resource { text: Some(text), .. } => Some(text),
            _ => None,
        }
    }
}

/// A tool exposed by an upstream server, as returned from `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
    /// Arbitrary metadata carried alongside the tool definition. Capability
    /// discovery stamps `server_name` into this map without disturbing any
    /// keys the upstream server already populated.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ClientCapabilities {
    pub experimental: Option<serde_json::Value>,
    pub sampling: Option<SamplingCapabilities>,
    pub roots: Option<RootsCapabilities>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ServerCapabilities {
    pub experimental: Option<serde_json::Value>,
    pub logging: Option<LoggingCapabilities>,
    pub prompts: Option<PromptCapabilities>,
    pub resources: Option<ResourceCapabilities>,
    pub tools: Option<ToolCapabilities>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SamplingCapabilities {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RootsCapabilities {
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoggingCapabilities {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptCapabilities {
    pub list_changed: Option<bool>,
}

impl Default for PromptCapabilities {
    fn default() -> Self {
        Self {
            list_changed: Some(false),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceCapabilities {
    pub subscribe: Option<bool>,
    pub list_changed: Option<bool>,
}

impl Default for ResourceCapabilities {
    fn default() -> Self {
        Self {
            subscribe: Some(false),
            list_changed: Some(false),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCapabilities {
    pub list_changed: Option<bool>,
}

impl Default for ToolCapabilities {
    fn default() -> Self {
        Self {
            list_changed: Some(false),
        }
    }
}

/// A prompt template, as returned from `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prompt {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptArgument {
    pub name: String,
    pub description: Option<String>,
    pub required: bool,
}

impl PromptArgument {
    pub fn required(name: impl Into<String>, description: Option<impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            description: description.map(Into::into),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, description: Option<impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            description: description.map(Into::into),
            required: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptMessage {
    pub role: String,
    pub content: Content,
}

impl PromptMessage {
    pub fn user(content: Content) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }

    pub fn assistant(content: Content) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
        }
    }
}

/// A resource exposed by an upstream server, as returned from `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub uri: Uri,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<MimeType>,
}

/// A parameterised resource template, as returned from `resources/templates/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceTemplate {
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
}

/// Severity carried by a `logging-message` notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }
}

/// Parameters sent on the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitializeRequest {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: ProtocolVersion,
    pub capabilities: ClientCapabilities,
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

/// Result of `initialize`, as returned by the upstream server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitializeResponse {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: ProtocolVersion,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// Result of `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallToolResult {
    pub content: Vec<Content>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    pub fn success(content: Vec<Content>) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(content: Vec<Content>) -> Self {
        Self {
            content,
            is_error: true,
        }
    }
}

/// Result of `resources/read`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadResourceResult {
    pub contents: Vec<Content>,
}

impl ReadResourceResult {
    pub fn new(contents: Vec<Content>) -> Self {
        Self { contents }
    }
}

/// Result of `prompts/get`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetPromptResult {
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

impl GetPromptResult {
    pub fn new(description: Option<String>, messages: Vec<PromptMessage>) -> Self {
        Self {
            description,
            messages,
        }
    }
}

/// Result of `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListResourcesResult {
    pub resources: Vec<Resource>,
    #[serde(rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

impl ListResourcesResult {
    pub fn new(resources: Vec<Resource>) -> Self {
        Self {
            resources,
            next_cursor: None,
        }
    }
}

/// Result of `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

impl ListToolsResult {
    pub fn new(tools: Vec<Tool>) -> Self {
        Self {
            tools,
            next_cursor: None,
        }
    }
}

/// Result of `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListPromptsResult {
    pub prompts: Vec<Prompt>,
    #[serde(rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

impl ListPromptsResult {
    pub fn new(prompts: Vec<Prompt>) -> Self {
        Self {
            prompts,
            next_cursor: None,
        }
    }
}

/// Result of `resources/templates/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListResourceTemplatesResult {
    #[serde(rename = "resourceTemplates")]
    pub resource_templates: Vec<ResourceTemplate>,
    #[serde(rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

impl ListResourceTemplatesResult {
    pub fn new(resource_templates: Vec<ResourceTemplate>) -> Self {
        Self {
            resource_templates,
            next_cursor: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_version_validates_format() {
        assert!(ProtocolVersion::new("2025-06-18").is_ok());
        assert!(ProtocolVersion::new("not-a-version").is_err());
    }

    #[test]
    fn uri_requires_scheme_separator() {
        assert!(Uri::new("everything://dashboard").is_ok());
        assert!(Uri::new("no-scheme-here").is_err());
    }

    #[test]
    fn tool_meta_round_trips_through_json() {
        let mut meta = serde_json::Map::new();
        meta.insert("server_name".into(), serde_json::json!("srv-A"));
        let tool = Tool {
            name: "echo".into(),
            description: None,
            input_schema: serde_json::json!({}),
            meta: Some(meta),
        };
        let encoded = serde_json::to_value(&tool).unwrap();
        let decoded: Tool = serde_json::from_value(encoded).unwrap();
        assert_eq!(
            decoded.meta.unwrap().get("server_name").unwrap(),
            "srv-A"
        );
    }
}
