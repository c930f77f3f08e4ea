use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Heap capacity ceiling; slot indices have to fit comfortably in a `u32`
/// with `u32::MAX` reserved as the invalid marker.
pub const MAX_DESCRIPTOR_CAPACITY: u32 = 1 << 20;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub descriptors: DescriptorCapacities,
    #[serde(default)]
    pub compiler: CompilerSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default)]
    pub shadertoy: ShadertoySection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct DescriptorCapacities {
    #[serde(default = "default_sampled_image")]
    pub sampled_image: u32,
    #[serde(default = "default_render_target")]
    pub render_target: u32,
    #[serde(default = "default_constant_buffer")]
    pub constant_buffer: u32,
    #[serde(default = "default_raw_buffer")]
    pub raw_buffer: u32,
}

impl Default for DescriptorCapacities {
    fn default() -> Self {
        Self {
            sampled_image: default_sampled_image(),
            render_target: default_render_target(),
            constant_buffer: default_constant_buffer(),
            raw_buffer: default_raw_buffer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerBackend {
    Naga,
    Shaderc,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CompilerSection {
    #[serde(default)]
    pub backend: Option<CompilerBackend>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerSection {
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputSection {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(
        default = "default_frame_interval",
        deserialize_with = "deserialize_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub frame_interval: Option<Duration>,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            frame_interval: default_frame_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ShadertoySection {
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_version() -> u32 {
    1
}

fn default_sampled_image() -> u32 {
    1024
}

fn default_render_target() -> u32 {
    256
}

fn default_constant_buffer() -> u32 {
    1024
}

fn default_raw_buffer() -> u32 {
    256
}

fn default_queue_depth() -> usize {
    4
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_frame_interval() -> Option<Duration> {
    Some(Duration::from_secs_f64(1.0 / 60.0))
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_secs(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs(v as u64)))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            descriptors: DescriptorCapacities::default(),
            compiler: CompilerSection::default(),
            worker: WorkerSection::default(),
            output: OutputSection::default(),
            shadertoy: ShadertoySection::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: EngineConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn frame_interval(&self) -> Duration {
        self.output
            .frame_interval
            .unwrap_or_else(|| Duration::from_secs_f64(1.0 / 60.0))
    }

    /// Non-empty API key, if one was configured.
    pub fn api_key(&self) -> Option<&str> {
        self.shadertoy
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        let heaps = [
            ("sampled_image", self.descriptors.sampled_image),
            ("render_target", self.descriptors.render_target),
            ("constant_buffer", self.descriptors.constant_buffer),
            ("raw_buffer", self.descriptors.raw_buffer),
        ];
        for (name, capacity) in heaps {
            if capacity == 0 || capacity > MAX_DESCRIPTOR_CAPACITY {
                return Err(ConfigError::Invalid(format!(
                    "descriptors.{name} must be between 1 and {MAX_DESCRIPTOR_CAPACITY}, got {capacity}"
                )));
            }
        }

        if self.worker.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "worker.queue_depth must be greater than zero".into(),
            ));
        }

        if self.output.width == 0 || self.output.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "output size must be non-zero, got {}x{}",
                self.output.width, self.output.height
            )));
        }

        if self.output.frame_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(ConfigError::Invalid(
                "output.frame_interval must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
