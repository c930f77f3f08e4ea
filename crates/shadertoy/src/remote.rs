use reqwest::blocking::Client;
use reqwest::Url;
use tracing::debug;

use crate::description::{parse_description, ShaderDescription};
use crate::DescriptionError;

const API_BASE: &str = "https://www.shadertoy.com/api/v1/";
const MEDIA_BASE: &str = "https://www.shadertoy.com/";

#[derive(Debug, Clone)]
pub struct ShadertoyConfig {
    pub api_key: String,
    pub api_base: Url,
    pub media_base: Url,
}

impl ShadertoyConfig {
    pub fn new(api_key: impl Into<String>) -> Result<Self, DescriptionError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(DescriptionError::MissingApiKey);
        }
        Ok(Self {
            api_key,
            api_base: parse_url(API_BASE)?,
            media_base: parse_url(MEDIA_BASE)?,
        })
    }
}

/// Blocking client for the public Shadertoy API. Runs on the compile worker,
/// never on the render thread.
#[derive(Debug, Clone)]
pub struct ShadertoyClient {
    http: Client,
    config: ShadertoyConfig,
}

impl ShadertoyClient {
    pub fn new(config: ShadertoyConfig) -> Result<Self, DescriptionError> {
        let http = Client::builder().build()?;
        Ok(Self { http, config })
    }

    pub fn fetch_description(
        &self,
        shader_id: &str,
    ) -> Result<ShaderDescription, DescriptionError> {
        let url = self.description_url(shader_id)?;
        debug!(shader = shader_id.trim(), "requesting shadertoy description");
        let body = self.http.get(url).send()?.error_for_status()?.text()?;
        parse_description(&body).map_err(|err| match err {
            DescriptionError::Json(_) => {
                let snippet = body.chars().take(200).collect::<String>();
                DescriptionError::UnexpectedResponse(snippet)
            }
            other => other,
        })
    }

    pub fn download_asset(&self, src: &str) -> Result<Vec<u8>, DescriptionError> {
        let url = self.resolve_media_url(src)?;
        debug!(%url, "downloading shadertoy asset");
        let response = self.http.get(url).send()?.error_for_status()?;
        Ok(response.bytes()?.to_vec())
    }

    fn description_url(&self, shader_id: &str) -> Result<Url, DescriptionError> {
        let shader_id = shader_id.trim();
        if shader_id.is_empty() {
            return Err(DescriptionError::InvalidHandle(
                "shader id must not be empty".to_string(),
            ));
        }
        let mut url = self.config.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| DescriptionError::InvalidUrl("invalid Shadertoy API base url".into()))?
            .pop_if_empty()
            .push("shaders")
            .push(shader_id);
        url.query_pairs_mut().append_pair("key", &self.config.api_key);
        Ok(url)
    }

    fn resolve_media_url(&self, src: &str) -> Result<Url, DescriptionError> {
        if src.starts_with("http://") || src.starts_with("https://") {
            return parse_url(src);
        }
        if src.starts_with("//") {
            return parse_url(&format!("https:{src}"));
        }
        self.config
            .media_base
            .join(src.trim_start_matches('/'))
            .map_err(|err| DescriptionError::InvalidUrl(format!("{src}: {err}")))
    }
}

fn parse_url(raw: &str) -> Result<Url, DescriptionError> {
    Url::parse(raw).map_err(|err| DescriptionError::InvalidUrl(format!("{raw}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ShadertoyClient {
        ShadertoyClient::new(ShadertoyConfig::new("key").unwrap()).unwrap()
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(matches!(
            ShadertoyConfig::new("   "),
            Err(DescriptionError::MissingApiKey)
        ));
    }

    #[test]
    fn media_urls_resolve_against_site_root() {
        let client = client();
        assert_eq!(
            client.resolve_media_url("/media/a/noise.png").unwrap().as_str(),
            "https://www.shadertoy.com/media/a/noise.png"
        );
        assert_eq!(
            client.resolve_media_url("//cdn.example.com/x.jpg").unwrap().as_str(),
            "https://cdn.example.com/x.jpg"
        );
        assert_eq!(
            client.resolve_media_url("http://example.com/y.png").unwrap().as_str(),
            "http://example.com/y.png"
        );
    }

    #[test]
    fn api_key_is_percent_encoded_in_query() {
        let client = ShadertoyClient::new(ShadertoyConfig::new("a&b=c d#e").unwrap()).unwrap();
        let url = client.description_url(" XsXXDn ").unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.shadertoy.com/api/v1/shaders/XsXXDn?key=a%26b%3Dc+d%23e"
        );
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs, vec![("key".to_string(), "a&b=c d#e".to_string())]);
    }

    #[test]
    fn blank_shader_id_fails_before_network() {
        assert!(matches!(
            client().fetch_description("  "),
            Err(DescriptionError::InvalidHandle(_))
        ));
    }
}
