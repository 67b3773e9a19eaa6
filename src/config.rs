//! Configuration for the thumbnail pipeline.
//!
//! Values come from code (`ThumbnailConfig::builder()`) or from `PAGESTRIP_*`
//! environment variables. Out-of-range values are clamped, unparsable values
//! are rejected.

use std::time::Duration;

use tracing::debug;

use crate::error::ConfigError;

/// Default number of cached thumbnails.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Default number of renderer calls allowed to run at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Maximum number of render workers.
const MAX_CONCURRENCY: usize = 16;

/// Default number of pages around the viewport rendered ahead of time.
pub const DEFAULT_NEIGHBORHOOD_RADIUS: u32 = 5;

/// Default thumbnail box in pixels.
pub const DEFAULT_TARGET_WIDTH: u32 = 150;
pub const DEFAULT_TARGET_HEIGHT: u32 = 200;

/// Default render resolution for previews.
pub const DEFAULT_TARGET_DPI: u32 = 48;

const MAX_TARGET_DPI: u32 = 600;

/// Resolution documents are laid out at (PDF points).
const BASE_DPI: f32 = 72.0;

/// Settings for one document session's thumbnail pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailConfig {
    /// Maximum number of decoded thumbnails kept alive by the cache.
    pub cache_capacity: usize,
    /// Maximum number of concurrent renderer calls.
    pub max_concurrency: usize,
    /// Pages on either side of the viewport treated as the priority neighborhood.
    pub neighborhood_radius: u32,
    /// Thumbnail bounding box width in pixels.
    pub target_width: u32,
    /// Thumbnail bounding box height in pixels.
    pub target_height: u32,
    /// Render resolution.
    pub target_dpi: u32,
    /// Fail a render that has not returned after this long. `None` waits forever.
    pub render_timeout: Option<Duration>,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            neighborhood_radius: DEFAULT_NEIGHBORHOOD_RADIUS,
            target_width: DEFAULT_TARGET_WIDTH,
            target_height: DEFAULT_TARGET_HEIGHT,
            target_dpi: DEFAULT_TARGET_DPI,
            render_timeout: None,
        }
    }
}

impl ThumbnailConfig {
    pub fn builder() -> ThumbnailConfigBuilder {
        ThumbnailConfigBuilder::new()
    }

    /// Builder seeded with these values, for layering overrides.
    pub fn into_builder(self) -> ThumbnailConfigBuilder {
        ThumbnailConfigBuilder { config: self }
    }

    /// Zoom factor matching `target_dpi`.
    pub fn target_zoom(&self) -> f32 {
        self.target_dpi as f32 / BASE_DPI
    }

    /// Load configuration from `PAGESTRIP_*` environment variables.
    ///
    /// Environment variables:
    /// - `PAGESTRIP_CACHE_CAPACITY`
    /// - `PAGESTRIP_MAX_CONCURRENCY`
    /// - `PAGESTRIP_NEIGHBORHOOD_RADIUS`
    /// - `PAGESTRIP_TARGET_DPI`
    /// - `PAGESTRIP_TARGET_SIZE` as `WIDTHxHEIGHT`
    /// - `PAGESTRIP_RENDER_TIMEOUT_MS` (0 disables the timeout)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` but reads values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(val) = lookup("PAGESTRIP_CACHE_CAPACITY") {
            builder = builder.cache_capacity(parse_value("PAGESTRIP_CACHE_CAPACITY", &val)?);
        }
        if let Some(val) = lookup("PAGESTRIP_MAX_CONCURRENCY") {
            builder = builder.max_concurrency(parse_value("PAGESTRIP_MAX_CONCURRENCY", &val)?);
        }
        if let Some(val) = lookup("PAGESTRIP_NEIGHBORHOOD_RADIUS") {
            builder =
                builder.neighborhood_radius(parse_value("PAGESTRIP_NEIGHBORHOOD_RADIUS", &val)?);
        }
        if let Some(val) = lookup("PAGESTRIP_TARGET_DPI") {
            builder = builder.target_dpi(parse_value("PAGESTRIP_TARGET_DPI", &val)?);
        }
        if let Some(val) = lookup("PAGESTRIP_TARGET_SIZE") {
            let (width, height) = parse_size(&val).ok_or_else(|| ConfigError::InvalidValue {
                key: "PAGESTRIP_TARGET_SIZE".to_string(),
                value: val.clone(),
            })?;
            builder = builder.target_size(width, height);
        }
        if let Some(val) = lookup("PAGESTRIP_RENDER_TIMEOUT_MS") {
            let ms: u64 = parse_value("PAGESTRIP_RENDER_TIMEOUT_MS", &val)?;
            builder = builder.render_timeout((ms > 0).then(|| Duration::from_millis(ms)));
        }

        let config = builder.build();
        debug!(?config, "Loaded thumbnail configuration");
        Ok(config)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_size(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.trim().split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Builder for `ThumbnailConfig`; clamps every value to a usable range.
#[derive(Debug, Clone)]
pub struct ThumbnailConfigBuilder {
    config: ThumbnailConfig,
}

impl ThumbnailConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ThumbnailConfig::default(),
        }
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity.max(1);
        self
    }

    pub fn max_concurrency(mut self, count: usize) -> Self {
        self.config.max_concurrency = count.clamp(1, MAX_CONCURRENCY);
        self
    }

    pub fn neighborhood_radius(mut self, pages: u32) -> Self {
        self.config.neighborhood_radius = pages;
        self
    }

    pub fn target_size(mut self, width: u32, height: u32) -> Self {
        self.config.target_width = width.max(1);
        self.config.target_height = height.max(1);
        self
    }

    pub fn target_dpi(mut self, dpi: u32) -> Self {
        self.config.target_dpi = dpi.clamp(1, MAX_TARGET_DPI);
        self
    }

    pub fn render_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.render_timeout = timeout;
        self
    }

    pub fn build(self) -> ThumbnailConfig {
        self.config
    }
}

impl Default for ThumbnailConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ThumbnailConfig::default();
        assert_eq!(config.cache_capacity, 100);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.neighborhood_radius, 5);
        assert_eq!((config.target_width, config.target_height), (150, 200));
        assert_eq!(config.target_dpi, 48);
        assert_eq!(config.render_timeout, None);
    }

    #[test]
    fn test_builder_clamping() {
        let config = ThumbnailConfig::builder()
            .cache_capacity(0)
            .max_concurrency(100)
            .target_dpi(0)
            .build();
        assert_eq!(config.cache_capacity, 1);
        assert_eq!(config.max_concurrency, MAX_CONCURRENCY);
        assert_eq!(config.target_dpi, 1);

        let config = ThumbnailConfig::builder().max_concurrency(0).build();
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn test_into_builder_keeps_values() {
        let base = ThumbnailConfig::builder().neighborhood_radius(9).build();
        let config = base.into_builder().max_concurrency(0).build();
        assert_eq!(config.neighborhood_radius, 9);
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn test_target_zoom() {
        let config = ThumbnailConfig::builder().target_dpi(144).build();
        assert!((config.target_zoom() - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_from_lookup() {
        let config = ThumbnailConfig::from_lookup(lookup_from(&[
            ("PAGESTRIP_CACHE_CAPACITY", "32"),
            ("PAGESTRIP_MAX_CONCURRENCY", "2"),
            ("PAGESTRIP_NEIGHBORHOOD_RADIUS", "3"),
            ("PAGESTRIP_TARGET_DPI", "72"),
            ("PAGESTRIP_TARGET_SIZE", "120x160"),
            ("PAGESTRIP_RENDER_TIMEOUT_MS", "2500"),
        ]))
        .unwrap();

        assert_eq!(config.cache_capacity, 32);
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.neighborhood_radius, 3);
        assert_eq!(config.target_dpi, 72);
        assert_eq!((config.target_width, config.target_height), (120, 160));
        assert_eq!(config.render_timeout, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_from_lookup_partial() {
        let config =
            ThumbnailConfig::from_lookup(lookup_from(&[("PAGESTRIP_MAX_CONCURRENCY", "8")]))
                .unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY); // default
    }

    #[test]
    fn test_zero_timeout_disables() {
        let config =
            ThumbnailConfig::from_lookup(lookup_from(&[("PAGESTRIP_RENDER_TIMEOUT_MS", "0")]))
                .unwrap();
        assert_eq!(config.render_timeout, None);
    }

    #[test]
    fn test_from_lookup_invalid() {
        let err = ThumbnailConfig::from_lookup(lookup_from(&[(
            "PAGESTRIP_CACHE_CAPACITY",
            "lots",
        )]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "PAGESTRIP_CACHE_CAPACITY".to_string(),
                value: "lots".to_string(),
            }
        );

        assert!(
            ThumbnailConfig::from_lookup(lookup_from(&[("PAGESTRIP_TARGET_SIZE", "150")]))
                .is_err()
        );
    }
}
