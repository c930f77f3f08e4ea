mod description;
mod remote;

pub use description::{
    parse_description, PassId, RenderInput, RenderOutput, RenderPass, ShaderDescription,
    ShaderInfo, COMMON_PASS_NAME, MAX_CHANNELS,
};
pub use remote::{ShadertoyClient, ShadertoyConfig};

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("failed to decode shader description: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Shadertoy API error: {0}")]
    Api(String),
    #[error("unexpected Shadertoy API response: {0}")]
    UnexpectedResponse(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("invalid shader handle: {0}")]
    InvalidHandle(String),
    #[error("a Shadertoy API key is required to fetch remote shaders")]
    MissingApiKey,
}

/// Where a shader description comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderHandle {
    ShadertoyId(String),
    LocalFile(PathBuf),
}

impl ShaderHandle {
    /// Accepts `shadertoy://ID`, a shadertoy.com view URL, or a path to a JSON file.
    pub fn from_input(input: &str) -> Result<Self, DescriptionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(DescriptionError::InvalidHandle(
                "shader reference must not be empty".to_string(),
            ));
        }

        if let Some(rest) = trimmed.strip_prefix("shadertoy://") {
            let id = rest.trim();
            if id.is_empty() {
                return Err(DescriptionError::InvalidHandle(
                    "shadertoy identifier missing after scheme".to_string(),
                ));
            }
            return Ok(Self::ShadertoyId(id.to_string()));
        }

        if trimmed.contains("shadertoy.com/") {
            let id = trimmed
                .split('/')
                .rev()
                .find(|segment| !segment.is_empty())
                .and_then(|segment| segment.split(['?', '#']).next())
                .filter(|id| !id.is_empty() && *id != "view");
            return match id {
                Some(id) => Ok(Self::ShadertoyId(id.to_string())),
                None => Err(DescriptionError::InvalidHandle(format!(
                    "unable to extract shader id from '{trimmed}'"
                ))),
            };
        }

        Ok(Self::LocalFile(PathBuf::from(trimmed)))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::LocalFile(_))
    }
}

impl fmt::Display for ShaderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShadertoyId(id) => write!(f, "shadertoy://{id}"),
            Self::LocalFile(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Resolves `src` fields of texture inputs to bytes.
#[derive(Debug, Clone)]
pub enum AssetOrigin {
    Remote(ShadertoyClient),
    Directory(PathBuf),
}

impl AssetOrigin {
    pub fn read(&self, src: &str) -> Result<Vec<u8>, DescriptionError> {
        match self {
            Self::Remote(client) => client.download_asset(src),
            Self::Directory(root) => {
                let path = root.join(src.trim_start_matches('/'));
                debug!(path = %path.display(), "reading local shader asset");
                fs::read(&path).map_err(|source| DescriptionError::Io { path, source })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedShader {
    pub description: ShaderDescription,
    pub assets: AssetOrigin,
}

/// Fetches or reads the description behind `handle`. Remote handles need a client.
pub fn load_shader(
    handle: &ShaderHandle,
    client: Option<&ShadertoyClient>,
) -> Result<LoadedShader, DescriptionError> {
    match handle {
        ShaderHandle::ShadertoyId(id) => {
            let client = client.ok_or(DescriptionError::MissingApiKey)?;
            let description = client.fetch_description(id)?;
            Ok(LoadedShader {
                description,
                assets: AssetOrigin::Remote(client.clone()),
            })
        }
        ShaderHandle::LocalFile(path) => {
            let description = load_description_file(path)?;
            let root = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            Ok(LoadedShader {
                description,
                assets: AssetOrigin::Directory(root),
            })
        }
    }
}

pub fn load_description_file(path: &Path) -> Result<ShaderDescription, DescriptionError> {
    let text = fs::read_to_string(path).map_err(|source| DescriptionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_description(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_shadertoy_scheme() {
        assert_eq!(
            ShaderHandle::from_input("shadertoy://abc").unwrap(),
            ShaderHandle::ShadertoyId("abc".into())
        );
    }

    #[test]
    fn extracts_id_from_view_url() {
        assert_eq!(
            ShaderHandle::from_input("https://www.shadertoy.com/view/XsXXDn?hl=en").unwrap(),
            ShaderHandle::ShadertoyId("XsXXDn".into())
        );
    }

    #[test]
    fn parses_local_path() {
        assert!(matches!(
            ShaderHandle::from_input("shaders/feedback.json").unwrap(),
            ShaderHandle::LocalFile(path) if path == PathBuf::from("shaders/feedback.json")
        ));
    }

    #[test]
    fn rejects_empty_references() {
        assert!(ShaderHandle::from_input("  ").is_err());
        assert!(ShaderHandle::from_input("shadertoy://").is_err());
    }

    #[test]
    fn remote_handle_without_client_needs_api_key() {
        let handle = ShaderHandle::ShadertoyId("abc".into());
        assert!(matches!(
            load_shader(&handle, None),
            Err(DescriptionError::MissingApiKey)
        ));
    }

    #[test]
    fn local_file_loads_with_sibling_assets() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"{ "renderpass": [ { "name": "Image", "type": "image",
            "code": "void mainImage(out vec4 c, in vec2 p) { c = vec4(1.0); }",
            "outputs": [ { "id": 0 } ] } ] }"#;
        let path = dir.path().join("demo.json");
        fs::write(&path, json).unwrap();
        fs::create_dir_all(dir.path().join("media")).unwrap();
        fs::write(dir.path().join("media/noise.png"), b"not really a png").unwrap();

        let loaded = load_shader(&ShaderHandle::LocalFile(path), None).unwrap();
        assert_eq!(loaded.description.render_passes.len(), 1);
        assert_eq!(
            loaded.assets.read("/media/noise.png").unwrap(),
            b"not really a png".to_vec()
        );
        assert!(matches!(
            loaded.assets.read("media/missing.png"),
            Err(DescriptionError::Io { .. })
        ));
    }
}
