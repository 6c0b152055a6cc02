// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

const DEFAULT_MEDIA_DEVICE: &str = "/dev/media0";
const DEFAULT_VIDEO_DEVICE: &str = "/dev/video0";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1000;

/// Parameters of one decoder instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DecoderConfig {
    /// Media controller node used to allocate requests.
    pub media_device: PathBuf,
    /// Video node of the memory-to-memory decoder.
    pub video_device: PathBuf,
    /// Number of requests allowed in flight. Derived from `live` when unset.
    pub render_delay: Option<u32>,
    pub request_timeout_ms: u64,
    /// Live sources favour latency over throughput and get no render delay by default.
    pub live: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            media_device: PathBuf::from(DEFAULT_MEDIA_DEVICE),
            video_device: PathBuf::from(DEFAULT_VIDEO_DEVICE),
            render_delay: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            live: false,
        }
    }
}

impl DecoderConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Error::ConfigParse)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn render_delay(&self) -> u32 {
        self.render_delay.unwrap_or(if self.live { 0 } else { 1 })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults() {
        let config = DecoderConfig::from_json_str("{}").unwrap();
        assert_eq!(config, DecoderConfig::default());
        assert_eq!(config.render_delay(), 1);
        assert_eq!(config.request_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn live_sources_have_no_render_delay() {
        let config = DecoderConfig::from_json_str(r#"{"live": true}"#).unwrap();
        assert_eq!(config.render_delay(), 0);

        let config =
            DecoderConfig::from_json_str(r#"{"live": true, "render_delay": 3}"#).unwrap();
        assert_eq!(config.render_delay(), 3);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            DecoderConfig::from_json_str(r#"{"render_dealy": 3}"#),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"media_device": "/dev/media2", "video_device": "/dev/video5", "request_timeout_ms": 250}}"#
        )
        .unwrap();
        let config = DecoderConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.media_device, PathBuf::from("/dev/media2"));
        assert_eq!(config.video_device, PathBuf::from("/dev/video5"));
        assert_eq!(config.request_timeout(), Duration::from_millis(250));

        assert!(matches!(
            DecoderConfig::from_json_file("/nonexistent/decoder.json"),
            Err(Error::ConfigRead { .. })
        ));
    }
}
