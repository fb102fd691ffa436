//! Configuration for blob-relay
//!
//! CLI arguments and environment variable handling using clap. Every flag
//! can also be set through the environment or a `.env` file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::cache::CacheConfig;
use crate::services::parse_base_url;

/// Which contract the origin offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OriginMode {
    /// The origin writes objects into a local artifact
    Destination,
    /// The origin returns a byte stream that can be piped to clients
    Stream,
}

/// blob-relay - streaming cache in front of a content-addressed origin
#[derive(Parser, Debug, Clone)]
#[command(name = "blob-relay")]
#[command(about = "Fetch-coalescing streaming cache for content-addressed blobs")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Maximum number of cached objects
    #[arg(long, env = "CACHE_MAX_ENTRIES", default_value = "256")]
    pub cache_max_entries: usize,

    /// Seconds an object stays cached, counted from when it was fetched
    #[arg(long, env = "CACHE_TTL_SECS", default_value = "3600")]
    pub cache_ttl_secs: u64,

    /// Directory for artifact files (emptied on startup)
    #[arg(long, env = "SCRATCH_DIR", default_value = "./scratch")]
    pub scratch_dir: PathBuf,

    /// Base URL of the origin; objects are fetched from {ORIGIN_URL}/{key}
    #[arg(long, env = "ORIGIN_URL")]
    pub origin_url: String,

    /// Origin contract
    #[arg(long, env = "ORIGIN_MODE", value_enum, default_value = "destination")]
    pub origin_mode: OriginMode,

    /// Base URL of the metadata service (optional)
    #[arg(long, env = "METADATA_URL")]
    pub metadata_url: Option<String>,

    /// Metadata lookup timeout in milliseconds
    #[arg(long, env = "METADATA_TIMEOUT_MS", default_value = "2000")]
    pub metadata_timeout_ms: u64,

    /// Origin fetch timeout in seconds (0 disables)
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value = "300")]
    pub fetch_timeout_secs: u64,

    /// Seconds between background eviction sweeps
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "60")]
    pub sweep_interval_secs: u64,

    /// Read size for delivery, in KiB
    #[arg(long, env = "DELIVERY_CHUNK_KB", default_value = "64")]
    pub delivery_chunk_kb: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_max_entries == 0 {
            return Err("CACHE_MAX_ENTRIES must be at least 1".to_string());
        }
        if self.cache_ttl_secs == 0 {
            return Err("CACHE_TTL_SECS must be at least 1".to_string());
        }
        if self.sweep_interval_secs == 0 {
            return Err("SWEEP_INTERVAL_SECS must be at least 1".to_string());
        }
        if self.delivery_chunk_kb == 0 {
            return Err("DELIVERY_CHUNK_KB must be at least 1".to_string());
        }
        validate_url("ORIGIN_URL", &self.origin_url)?;
        if let Some(url) = &self.metadata_url {
            validate_url("METADATA_URL", url)?;
        }
        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.cache_max_entries,
            ttl: Duration::from_secs(self.cache_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            scratch_dir: self.scratch_dir.clone(),
        }
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        (self.fetch_timeout_secs > 0).then(|| Duration::from_secs(self.fetch_timeout_secs))
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn delivery_chunk_size(&self) -> usize {
        self.delivery_chunk_kb * 1024
    }
}

fn validate_url(name: &str, url: &str) -> Result<(), String> {
    parse_base_url(url)
        .map(|_| ())
        .map_err(|e| format!("{}: {}", name, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["blob-relay", "--origin-url", "http://origin.local"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(args.cache_max_entries, 256);
        assert_eq!(args.origin_mode, OriginMode::Destination);
        assert_eq!(args.fetch_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(args.delivery_chunk_size(), 64 * 1024);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_disables() {
        let args = parse(&["--fetch-timeout-secs", "0", "--origin-mode", "stream"]);
        assert_eq!(args.fetch_timeout(), None);
        assert_eq!(args.origin_mode, OriginMode::Stream);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(parse(&["--cache-max-entries", "0"]).validate().is_err());
        assert!(parse(&["--cache-ttl-secs", "0"]).validate().is_err());
        assert!(parse(&["--delivery-chunk-kb", "0"]).validate().is_err());
        assert!(parse(&["--metadata-url", "ftp://meta"]).validate().is_err());

        let mut args = parse(&[]);
        args.origin_url = "origin.local".to_string();
        assert!(args.validate().is_err());
        args.origin_url = "https://".to_string();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unparseable_origin() {
        let args = parse(&["--origin-url", "http://host:notaport/x y"]);
        let err = args.validate().unwrap_err();
        assert!(err.starts_with("ORIGIN_URL"), "{}", err);

        assert!(parse(&["--origin-url", "https://origin.local:8443/blobs"]).validate().is_ok());
    }
}
