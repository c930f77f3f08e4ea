//! Serde model for multi-pass shader descriptions as served by the Shadertoy
//! API (or saved from it). The renderer's graph builder walks these passes to
//! create one node per pass and wire channel inputs to the producing pass.
//!
//! Types:
//!
//! - `ShaderDescription` holds optional metadata plus the ordered render passes.
//! - `RenderPass`, `RenderInput`, and `RenderOutput` mirror the JSON schema.
//! - `PassId` normalizes ids that Shadertoy serializes either as integers or
//!   as short hash strings.
//!
//! Functions:
//!
//! - `parse_description` accepts either the API envelope (`{"Shader": ...}`)
//!   or a bare `{"renderpass": [...]}` document.
//! - `ShaderDescription::validate` returns human-readable issues without
//!   failing fast so callers can report every problem at once.
use std::collections::HashSet;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::DescriptionError;

/// Shadertoy exposes four input channels per pass (`iChannel0-3`).
pub const MAX_CHANNELS: u8 = 4;

/// Name Shadertoy gives the pass whose code is shared by every other pass.
pub const COMMON_PASS_NAME: &str = "common";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ShaderDescription {
    #[serde(default)]
    pub info: Option<ShaderInfo>,
    #[serde(rename = "renderpass")]
    pub render_passes: Vec<RenderPass>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ShaderInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RenderPass {
    pub name: String,
    #[serde(rename = "type", default)]
    pub pass_type: String,
    pub code: String,
    #[serde(default)]
    pub inputs: Vec<RenderInput>,
    #[serde(default)]
    pub outputs: Vec<RenderOutput>,
}

impl RenderPass {
    /// True for the shared-source container, which never becomes a graph node.
    pub fn is_common(&self) -> bool {
        self.name.trim().eq_ignore_ascii_case(COMMON_PASS_NAME)
            || self.pass_type.eq_ignore_ascii_case(COMMON_PASS_NAME)
    }

    /// True for the pass Shadertoy presents to the screen.
    pub fn is_image(&self) -> bool {
        self.pass_type.eq_ignore_ascii_case("image")
            || self.name.trim().eq_ignore_ascii_case("image")
    }

    pub fn output_id(&self) -> Option<PassId> {
        self.outputs.first().map(|output| output.id)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RenderInput {
    #[serde(default)]
    pub id: Option<PassId>,
    #[serde(default)]
    pub channel: u8,
    #[serde(default)]
    pub src: Option<String>,
    #[serde(rename = "ctype")]
    pub channel_type: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RenderOutput {
    pub id: PassId,
    #[serde(default)]
    pub channel: u8,
}

/// Identifier linking a pass output to the inputs that read it.
///
/// Older API responses use small integers while newer ones use opaque strings
/// such as `"4dXGR8"`. Numeric strings keep their value; other strings are
/// folded through FNV-1a so the same id always maps to the same number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub i64);

impl PassId {
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        if let Ok(value) = trimmed.parse::<i64>() {
            return Self(value);
        }
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in trimmed.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        Self((hash >> 1) as i64)
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PassId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl Serialize for PassId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for PassId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl<'de> de::Visitor<'de> for Visitor {
            type Value = PassId;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("an integer or string pass id")
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(PassId(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                i64::try_from(v)
                    .map(PassId)
                    .map_err(|_| E::custom(format!("pass id {v} out of range")))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if v.trim().is_empty() {
                    return Err(E::custom("pass id must not be empty"));
                }
                Ok(PassId::from_text(v))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(rename = "Shader")]
    shader: ShaderDescription,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(alias = "Error")]
    error: String,
}

/// Decodes a description from JSON text.
pub fn parse_description(json: &str) -> Result<ShaderDescription, DescriptionError> {
    // Try the API envelope first since that is what remote fetches return.
    if let Ok(envelope) = serde_json::from_str::<ApiEnvelope>(json) {
        return Ok(envelope.shader);
    }
    if let Ok(err) = serde_json::from_str::<ApiError>(json) {
        return Err(DescriptionError::Api(err.error));
    }
    let description: ShaderDescription = serde_json::from_str(json)?;
    Ok(description)
}

impl ShaderDescription {
    pub fn name(&self) -> Option<&str> {
        self.info
            .as_ref()
            .map(|info| info.name.trim())
            .filter(|name| !name.is_empty())
    }

    pub fn common_code(&self) -> String {
        let mut common = String::new();
        for pass in self.render_passes.iter().filter(|pass| pass.is_common()) {
            common.push_str(&pass.code);
            if !common.ends_with('\n') {
                common.push('\n');
            }
        }
        common
    }

    pub fn graph_passes(&self) -> impl Iterator<Item = &RenderPass> {
        self.render_passes.iter().filter(|pass| !pass.is_common())
    }

    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.graph_passes().next().is_none() {
            issues.push("description must declare at least one renderable pass".to_string());
        }
        let mut seen_outputs = HashSet::new();
        for pass in self.graph_passes() {
            match pass.outputs.len() {
                1 => {
                    let id = pass.outputs[0].id;
                    if !seen_outputs.insert(id) {
                        issues.push(format!(
                            "pass '{}' reuses output id {} already claimed by another pass",
                            pass.name, id
                        ));
                    }
                }
                count => issues.push(format!(
                    "pass '{}' declares {} outputs; exactly one is required",
                    pass.name, count
                )),
            }
            for input in &pass.inputs {
                if input.channel >= MAX_CHANNELS {
                    issues.push(format!(
                        "pass '{}' uses channel {} which exceeds Shadertoy limit",
                        pass.name, input.channel
                    ));
                }
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_PASS: &str = r#"
    {
        "Shader": {
            "info": { "id": "abc123", "name": "Feedback", "tags": ["demo"] },
            "renderpass": [
                {
                    "name": "Common",
                    "type": "common",
                    "code": "float shared_gain() { return 0.5; }",
                    "inputs": [],
                    "outputs": []
                },
                {
                    "name": "Buffer A",
                    "type": "buffer",
                    "code": "void mainImage(out vec4 c, in vec2 p) { c = vec4(shared_gain()); }",
                    "inputs": [ { "id": "4dXGR8", "channel": 0, "ctype": "buffer" } ],
                    "outputs": [ { "id": "4dXGR8", "channel": 0 } ]
                },
                {
                    "name": "Image",
                    "type": "image",
                    "code": "void mainImage(out vec4 c, in vec2 p) { c = texture(iChannel0, p); }",
                    "inputs": [ { "id": "4dXGR8", "channel": 0, "ctype": "buffer" } ],
                    "outputs": [ { "id": 37, "channel": 0 } ]
                }
            ]
        }
    }
    "#;

    #[test]
    fn parses_api_envelope_and_string_ids() {
        let description = parse_description(TWO_PASS).expect("valid description");
        assert_eq!(description.name(), Some("Feedback"));
        assert_eq!(description.render_passes.len(), 3);

        let buffer = &description.render_passes[1];
        assert_eq!(buffer.output_id(), Some(PassId::from_text("4dXGR8")));
        assert_eq!(buffer.inputs[0].id, buffer.output_id());
        assert_eq!(description.render_passes[2].output_id(), Some(PassId(37)));
        assert!(description.validate().is_empty());
    }

    #[test]
    fn parses_bare_renderpass_document() {
        let json = r#"{ "renderpass": [ { "name": "Image", "code": "void mainImage(out vec4 c, in vec2 p) {}", "outputs": [ { "id": "7" } ] } ] }"#;
        let description = parse_description(json).expect("bare document");
        assert!(description.info.is_none());
        assert_eq!(description.render_passes[0].output_id(), Some(PassId(7)));
    }

    #[test]
    fn common_pass_is_not_a_graph_pass() {
        let description = parse_description(TWO_PASS).unwrap();
        let names: Vec<_> = description.graph_passes().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Buffer A", "Image"]);
        assert!(description.common_code().contains("shared_gain"));
    }

    #[test]
    fn api_error_is_reported() {
        let err = parse_description(r#"{ "Error": "Shader not found" }"#).unwrap_err();
        assert!(matches!(err, DescriptionError::Api(ref message) if message == "Shader not found"));
    }

    #[test]
    fn validation_flags_bad_channels_and_outputs() {
        let json = r#"
        { "renderpass": [
            { "name": "A", "code": "", "inputs": [ { "id": 1, "channel": 5, "ctype": "buffer" } ], "outputs": [ { "id": 1 } ] },
            { "name": "B", "code": "", "outputs": [ { "id": 1 } ] },
            { "name": "C", "code": "", "outputs": [] }
        ] }
        "#;
        let issues = parse_description(json).unwrap().validate();
        assert_eq!(issues.len(), 3, "{issues:?}");
        assert!(issues.iter().any(|issue| issue.contains("channel 5")));
        assert!(issues.iter().any(|issue| issue.contains("reuses output id 1")));
        assert!(issues.iter().any(|issue| issue.contains("declares 0 outputs")));
    }

    #[test]
    fn hashed_ids_are_stable() {
        assert_eq!(PassId::from_text("XsXGR8"), PassId::from_text(" XsXGR8 "));
        assert_ne!(PassId::from_text("XsXGR8"), PassId::from_text("4sXGR8"));
        assert!(PassId::from_text("XsXGR8").value() >= 0);
    }
}
