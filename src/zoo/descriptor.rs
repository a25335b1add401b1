//! Canonical tool identity.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    config::is_valid_server_name,
    error::{GatewayError, GatewayResult},
};

/// Qualified-name delimiter. Server names may not contain it.
pub const QUALIFIED_NAME_DELIMITER: char = '.';

/// Parameters listed in an affordance hint are capped here.
const MAX_HINT_PARAMS: usize = 5;

/// Split `"<server>.<local_name>"` into its parts.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    let (server, local) = name.split_once(QUALIFIED_NAME_DELIMITER)?;
    if server.is_empty() || local.is_empty() {
        return None;
    }
    Some((server, local))
}

/// The canonical record for one downstream tool. Once indexed, the identity
/// fields (`qualified_name`, `server`, `local_name`) never change for the
/// process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub qualified_name: String,
    pub server: String,
    pub local_name: String,
    pub description: String,
    pub input_schema: Map<String, Value>,
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub affordance_hint: String,
}

impl ToolDescriptor {
    pub fn new(
        server: impl Into<String>,
        local_name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Map<String, Value>,
        tags: BTreeSet<String>,
    ) -> GatewayResult<Self> {
        let server = server.into();
        let local_name = local_name.into();
        if !is_valid_server_name(&server) {
            return Err(GatewayError::InvalidToolName(format!(
                "server '{}' contains characters outside [A-Za-z0-9_-]",
                server
            )));
        }
        if local_name.is_empty() {
            return Err(GatewayError::InvalidToolName(format!(
                "server '{}' exposed a tool with an empty name",
                server
            )));
        }
        let description = description.into();
        let affordance_hint = derive_affordance_hint(&description, &input_schema);
        Ok(Self {
            qualified_name: format!("{}{}{}", server, QUALIFIED_NAME_DELIMITER, local_name),
            server,
            local_name,
            description,
            input_schema,
            tags,
            embedding: None,
            affordance_hint,
        })
    }

    /// Build a descriptor from a tool returned by a downstream `tools/list`.
    pub fn from_mcp_tool(
        server: &str,
        tool: &rmcp::model::Tool,
        tags: &[String],
    ) -> GatewayResult<Self> {
        Self::new(
            server,
            tool.name.to_string(),
            tool.description
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_default(),
            (*tool.input_schema).clone(),
            tags.iter().cloned().collect(),
        )
    }

    /// The text fed to the embedding model for this tool.
    pub fn embedding_text(&self) -> String {
        let mut text = format!("{}: {}", self.local_name, self.description);
        if !self.tags.is_empty() {
            text.push_str(" [");
            let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
            text.push_str(&tags.join(", "));
            text.push(']');
        }
        text
    }

    /// Description composed for the client: the raw description plus the
    /// affordance hint, newline separated.
    pub fn client_description(&self) -> String {
        match (self.description.is_empty(), self.affordance_hint.is_empty()) {
            (false, false) => format!("{}\n{}", self.description, self.affordance_hint),
            (false, true) => self.description.clone(),
            (true, _) => self.affordance_hint.clone(),
        }
    }
}

/// Derive the cached micro-summary:
/// `"Use when: <first sentence> | Inputs: <p1*, p2, …>"`, required parameters
/// starred, at most five listed. Either half degrades away when empty.
fn derive_affordance_hint(description: &str, input_schema: &Map<String, Value>) -> String {
    let use_when = description
        .split('.')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let required: BTreeSet<&str> = input_schema
        .get("required")
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let params: Vec<String> = input_schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| {
            props
                .keys()
                .take(MAX_HINT_PARAMS)
                .map(|name| {
                    if required.contains(name.as_str()) {
                        format!("{}*", name)
                    } else {
                        name.clone()
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    match (use_when, params.is_empty()) {
        (Some(sentence), false) => {
            format!("Use when: {} | Inputs: {}", sentence, params.join(", "))
        }
        (Some(sentence), true) => format!("Use when: {}", sentence),
        (None, false) => format!("Inputs: {}", params.join(", ")),
        (None, true) => String::new(),
    }
}
