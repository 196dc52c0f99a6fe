use spool::*;

/// A valid single-clip configuration.
pub fn video_config(prompt: &str) -> JobConfiguration {
    JobConfiguration::VideoGenerationV1(VideoGenerationConfig::new(
        prompt,
        30,
        Resolution::Hd1080,
    ))
}

/// A multi-scene configuration with `scenes` valid scenes.
pub fn batch_video_config(scenes: usize) -> JobConfiguration {
    JobConfiguration::BatchVideoGenerationV1(BatchVideoGenerationConfig {
        scenes: (0..scenes)
            .map(|i| VideoGenerationConfig::new(format!("scene {i}"), 10, Resolution::Hd720))
            .collect(),
        stitch: true,
    })
}

pub fn video_request(priority: JobPriority) -> JobRequest {
    JobRequest::new(priority, video_config("a lighthouse at dusk"))
}

/// Rejected by configuration validation: the prompt is blank.
pub fn invalid_request() -> JobRequest {
    JobRequest::new(JobPriority::Normal, video_config("   "))
}

pub fn owner() -> OwnerId {
    OwnerId::new()
}
