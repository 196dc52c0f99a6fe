//! Typed job configuration.
//!
//! The configuration travels through the store as JSON, tagged with a schema
//! name that carries both the job type and a version, for example
//! `{"schema": "video_generation.v1", "prompt": "...", ...}`. Adding a field
//! that older rows cannot provide means adding a new `...V2` variant rather
//! than changing an existing one.

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::job::JobType;

/// Longest clip a single job may request.
pub const MAX_DURATION_SECONDS: u32 = 600;
const MAX_PROMPT_CHARS: usize = 4000;
const MAX_SCENES: usize = 50;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "480p")]
    Sd480,
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "1080p")]
    Hd1080,
    #[serde(rename = "2160p")]
    Uhd2160,
}

/// Parameters for a single generated clip.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoGenerationConfig {
    pub prompt: String,
    pub duration_seconds: u32,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl VideoGenerationConfig {
    pub fn new(
        prompt: impl Into<String>,
        duration_seconds: u32,
        resolution: Resolution,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            duration_seconds,
            resolution,
            template_id: None,
            voice: None,
        }
    }

    fn validate(&self) -> Result<(), QueueError> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(QueueError::validation("prompt must not be empty"));
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(QueueError::validation(format!(
                "prompt exceeds {MAX_PROMPT_CHARS} characters"
            )));
        }
        if self.duration_seconds == 0 || self.duration_seconds > MAX_DURATION_SECONDS {
            return Err(QueueError::validation(format!(
                "duration_seconds must be within 1..={MAX_DURATION_SECONDS}, got {}",
                self.duration_seconds
            )));
        }
        Ok(())
    }
}

/// A multi-scene render produced as one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchVideoGenerationConfig {
    pub scenes: Vec<VideoGenerationConfig>,
    #[serde(default)]
    pub stitch: bool,
}

/// Configuration payload of a job, discriminated by schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema")]
pub enum JobConfiguration {
    #[serde(rename = "video_generation.v1")]
    VideoGenerationV1(VideoGenerationConfig),
    #[serde(rename = "batch_video_generation.v1")]
    BatchVideoGenerationV1(BatchVideoGenerationConfig),
}

impl JobConfiguration {
    pub fn job_type(&self) -> JobType {
        match self {
            JobConfiguration::VideoGenerationV1(_) => JobType::VideoGeneration,
            JobConfiguration::BatchVideoGenerationV1(_) => {
                JobType::BatchVideoGeneration
            }
        }
    }

    pub fn schema(&self) -> &'static str {
        match self {
            JobConfiguration::VideoGenerationV1(_) => "video_generation.v1",
            JobConfiguration::BatchVideoGenerationV1(_) => {
                "batch_video_generation.v1"
            }
        }
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        match self {
            JobConfiguration::VideoGenerationV1(config) => config.validate(),
            JobConfiguration::BatchVideoGenerationV1(config) => {
                if config.scenes.is_empty() {
                    return Err(QueueError::validation(
                        "batch video generation needs at least one scene",
                    ));
                }
                if config.scenes.len() > MAX_SCENES {
                    return Err(QueueError::validation(format!(
                        "at most {MAX_SCENES} scenes per job"
                    )));
                }
                config.scenes.iter().try_for_each(|scene| scene.validate())
            }
        }
    }

    /// Serialized form stored in the `configuration` column.
    pub fn to_json(&self) -> Result<serde_json::Value, QueueError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, QueueError> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_is_tagged_with_schema() {
        let config = JobConfiguration::VideoGenerationV1(VideoGenerationConfig::new(
            "a fox in the snow",
            12,
            Resolution::Hd1080,
        ));
        let value = config.to_json().unwrap();
        assert_eq!(value["schema"], "video_generation.v1");
        assert_eq!(value["resolution"], "1080p");
        assert_eq!(JobConfiguration::from_json(value).unwrap(), config);
    }

    #[test]
    fn test_unknown_schema_is_rejected() {
        let value = serde_json::json!({"schema": "video_generation.v9", "prompt": "x"});
        assert!(JobConfiguration::from_json(value).is_err());
    }

    #[test]
    fn test_validation_limits() {
        let empty = JobConfiguration::VideoGenerationV1(VideoGenerationConfig::new(
            "   ",
            10,
            Resolution::Hd720,
        ));
        assert!(empty.validate().is_err());

        let too_long = JobConfiguration::VideoGenerationV1(VideoGenerationConfig::new(
            "ok",
            MAX_DURATION_SECONDS + 1,
            Resolution::Hd720,
        ));
        assert!(too_long.validate().is_err());

        let no_scenes = JobConfiguration::BatchVideoGenerationV1(BatchVideoGenerationConfig {
            scenes: Vec::new(),
            stitch: true,
        });
        assert!(no_scenes.validate().is_err());
        assert_eq!(no_scenes.job_type(), JobType::BatchVideoGeneration);
    }
}
