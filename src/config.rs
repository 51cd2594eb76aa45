use std::env;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Process-wide configuration, loaded once from the environment and treated
/// as immutable afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_concurrent_recordings: usize,
    pub max_recording_hours: u64,
    pub max_recovery_attempts: u32,

    pub output_dir: PathBuf,
    pub database_dir: PathBuf,

    pub convert_flv_to_mp4: bool,
    /// When conversion is on: hand finished files to the durable transcode
    /// queue (true) or run the encoder synchronously in the finalization
    /// pipeline (false).
    pub queue_conversions: bool,
    pub delete_flv_after_convert: bool,
    /// Files at or above this size route to the remote backend. Negative
    /// disables cloud routing entirely.
    pub cloud_convert_threshold: i64,
    /// Empty disables the remote backend.
    pub cloud_convert_api_key: String,

    /// Base URL of the upstream live-platform API the recorder consumes.
    pub upstream_api_base: String,

    pub upload_buffer_size: usize,
    pub download_buffer_size: usize,
    /// BufWriter size used while writing remote download results.
    pub download_writer_buffer_size: usize,
    /// BufWriter size used by the live capture file writer.
    pub live_stream_writer_buffer_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            max_concurrent_recordings: parse(env_or("MAX_CONCURRENT_RECORDINGS", "3"), "MAX_CONCURRENT_RECORDINGS")?,
            max_recording_hours: parse(env_or("MAX_RECORDING_HOURS", "5"), "MAX_RECORDING_HOURS")?,
            max_recovery_attempts: parse(env_or("MAX_RECOVERY_ATTEMPTS", "5"), "MAX_RECOVERY_ATTEMPTS")?,
            output_dir: PathBuf::from(env_or("OUTPUT_DIR", "records")),
            database_dir: PathBuf::from(env_or("DATABASE_DIR", "database")),
            convert_flv_to_mp4: env_or("CONVERT_FLV_TO_MP4", "") == "true",
            queue_conversions: env_or("QUEUE_CONVERSIONS", "true") == "true",
            delete_flv_after_convert: env_or("DELETE_FLV_AFTER_CONVERT", "") == "true",
            // 1 GiB
            cloud_convert_threshold: parse(env_or("CLOUDCONVERT_THRESHOLD", "1073741824"), "CLOUDCONVERT_THRESHOLD")?,
            cloud_convert_api_key: env_or("CLOUDCONVERT_API_KEY", ""),
            upstream_api_base: env_or("UPSTREAM_API_BASE", "http://localhost:8080/api"),
            upload_buffer_size: parse(env_or("UPLOAD_BUFFER_SIZE", "5242880"), "UPLOAD_BUFFER_SIZE")?,
            download_buffer_size: parse(env_or("DOWNLOAD_BUFFER_SIZE", "5242880"), "DOWNLOAD_BUFFER_SIZE")?,
            download_writer_buffer_size: parse(env_or("STREAM_WRITER_BUFFER_SIZE", "1048576"), "STREAM_WRITER_BUFFER_SIZE")?,
            live_stream_writer_buffer_size: parse(env_or("LIVE_STREAM_WRITER_BUFFER_SIZE", "5242880"), "LIVE_STREAM_WRITER_BUFFER_SIZE")?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_recordings: 3,
            max_recording_hours: 5,
            max_recovery_attempts: 5,
            output_dir: PathBuf::from("records"),
            database_dir: PathBuf::from("database"),
            convert_flv_to_mp4: false,
            queue_conversions: true,
            delete_flv_after_convert: false,
            cloud_convert_threshold: 1024 * 1024 * 1024,
            cloud_convert_api_key: String::new(),
            upstream_api_base: "http://localhost:8080/api".to_string(),
            upload_buffer_size: 5 * 1024 * 1024,
            download_buffer_size: 5 * 1024 * 1024,
            download_writer_buffer_size: 1024 * 1024,
            // 5 MiB suits ~4.5 Mbps 1080p30 with the 5 s flush cadence.
            live_stream_writer_buffer_size: 5 * 1024 * 1024,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn parse<T: std::str::FromStr>(value: String, key: &'static str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.max_concurrent_recordings, 3);
        assert_eq!(cfg.max_recording_hours, 5);
        assert_eq!(cfg.max_recovery_attempts, 5);
        assert_eq!(cfg.cloud_convert_threshold, 1 << 30);
        assert!(!cfg.convert_flv_to_mp4);
        assert!(cfg.queue_conversions);
    }
}
