use config::Config;
use serde::Deserialize;
use std::{path::PathBuf, str};
use tracing::*;
use zenoh::config::Config as ZenohConfig;

use crate::error::KairaError;

/// Use default config if no path is provided
pub fn get_configuration(config: &Option<PathBuf>) -> Result<KairaConfig, anyhow::Error> {
    let settings = if let Some(config) = config {
        info!("Using configuration from {:?}", config);
        Config::builder()
            .add_source(config::Environment::with_prefix("APP"))
            .add_source(config::File::with_name(
                config
                    .to_str()
                    .ok_or_else(|| anyhow::anyhow!("Failed to convert path"))?,
            ))
            .build()?
    } else {
        info!("Using dev configuration");
        Config::builder()
            .add_source(config::Environment::with_prefix("APP"))
            .add_source(config::File::with_name("config/settings"))
            .build()?
    };

    Ok(settings.try_deserialize()?)
}

#[derive(Deserialize, Debug, Clone)]
pub struct KairaConfig {
    pub zenoh: KairaZenohConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub wake_word: WakeWordConfig,
    #[serde(default)]
    pub identity: IdentityTrackerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

/// Fabric endpoint registry. Every topic the processes agree on is
/// injected from here rather than hardcoded at the call sites.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TopicConfig {
    pub frames: String,
    pub identity: String,
    pub transcription: String,
    pub prompt: String,
    pub audio: String,
    /// Delivery queue depth for fan-out subscribers. A slow subscriber
    /// keeps only the newest messages up to this count.
    pub fanout_hwm: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        TopicConfig {
            frames: "camera_0".to_owned(),
            identity: "current_identity".to_owned(),
            transcription: "ai_transcription".to_owned(),
            prompt: "ai_prompt".to_owned(),
            audio: "ai_audio".to_owned(),
            fanout_hwm: 1,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AudioConfig {
    pub input_device: Option<String>,
    pub capture_sample_rate: u32,
    pub capture_chunk_size: usize,
    pub playback_sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            input_device: None,
            capture_sample_rate: 16_000,
            capture_chunk_size: 2048,
            playback_sample_rate: 24_000,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WakeWordConfig {
    pub threshold: f32,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        WakeWordConfig { threshold: 0.01 }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct IdentityTrackerConfig {
    /// Consecutive identical labels before a new identity is confirmed.
    pub confirm_new: u32,
    /// Consecutive unknown labels before a confirmed identity is lost.
    pub confirm_lost: u32,
    /// Classify every Nth received frame.
    pub classify_stride: u32,
    /// Maximum descriptor distance accepted as a match.
    pub match_threshold: f32,
    pub descriptor_file: Option<PathBuf>,
}

impl Default for IdentityTrackerConfig {
    fn default() -> Self {
        IdentityTrackerConfig {
            confirm_new: 3,
            confirm_lost: 5,
            classify_stride: 10,
            match_threshold: 0.6,
            descriptor_file: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CameraConfig {
    pub index: usize,
    /// Publish generated test frames instead of opening a capture device.
    pub synthetic: bool,
    pub image_width: u32,
    pub image_height: u32,
}

impl CameraConfig {
    pub fn frame_topic(&self) -> String {
        format!("camera_{}", self.index)
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            index: 0,
            synthetic: false,
            image_width: 640,
            image_height: 480,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    pub endpoint: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            endpoint: None,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct KairaZenohConfig {
    #[serde(default)]
    pub connect: Vec<zenoh_config::EndPoint>,
    #[serde(default)]
    pub listen: Vec<zenoh_config::EndPoint>,
    pub config_path: Option<String>,
}

impl KairaZenohConfig {
    pub fn get_zenoh_config(&self) -> anyhow::Result<ZenohConfig> {
        let mut config = if let Some(conf_file) = &self.config_path {
            ZenohConfig::from_file(conf_file).map_err(KairaError::ZenohError)?
        } else {
            ZenohConfig::default()
        };
        if !self.connect.is_empty() {
            config.connect.endpoints = self.connect.clone();
        }
        if !self.listen.is_empty() {
            config.listen.endpoints = self.listen.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static DEFAULT_CONFIG: &str = include_str!("../config/settings.yaml");

    #[test]
    fn test_config() {
        let builder = Config::builder()
            .add_source(config::File::from_str(
                DEFAULT_CONFIG,
                config::FileFormat::Yaml,
            ))
            .build()
            .unwrap();
        builder.try_deserialize::<KairaConfig>().unwrap();
    }

    #[test]
    fn shipped_config_matches_tuned_defaults() {
        let builder = Config::builder()
            .add_source(config::File::from_str(
                DEFAULT_CONFIG,
                config::FileFormat::Yaml,
            ))
            .build()
            .unwrap();
        let config: KairaConfig = builder.try_deserialize().unwrap();
        assert_eq!(config.wake_word.threshold, 0.01);
        assert_eq!(config.audio.capture_chunk_size, 2048);
        assert_eq!(config.identity.confirm_new, 3);
        assert_eq!(config.identity.confirm_lost, 5);
        assert_eq!(config.topics.fanout_hwm, 1);
        assert_eq!(config.camera.frame_topic(), "camera_0");
    }
}
