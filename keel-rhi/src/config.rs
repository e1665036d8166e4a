//! Device configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use keel_core::log;

use crate::pipeline::MAX_SHADOW_CASCADES;
use crate::{RhiError, RhiResult};

/// Environment variable that forces the conservative safe mode at initialization.
pub const SAFE_MODE_ENV: &str = "KEEL_SAFE_MODE";

/// Called once when the GPU is considered hung. Must not return control to the frame loop
/// expecting the device to work again.
pub type FatalHandler = Arc<dyn Fn(&RhiError) + Send + Sync>;

/// Render device configuration.
#[derive(Clone)]
pub struct RhiConfig {
    /// Number of ring slots (frames the CPU may record ahead of the GPU).
    pub frames_in_flight: usize,
    /// Capacity in bytes of each slot's transient upload arena.
    pub transient_arena_size: u64,
    /// Alignment of every arena allocation. Must be a power of two.
    pub upload_alignment: u64,
    /// Bounded wait on a ring slot fence. Expiry is treated as a GPU hang.
    pub fence_timeout: Duration,
    /// Bounded wait on output image acquisition.
    pub acquire_timeout: Duration,
    /// Number of shadow cascades (array layers of the shadow map).
    pub shadow_cascades: u32,
    /// Width and height of each shadow cascade.
    pub shadow_map_size: u32,
    /// Synchronous uploads and a GPU idle after every frame.
    pub safe_mode: bool,
    pub fatal_handler: FatalHandler,
}

impl Default for RhiConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            transient_arena_size: 4 * 1024 * 1024,
            upload_alignment: 256,
            fence_timeout: Duration::from_secs(2),
            acquire_timeout: Duration::from_secs(1),
            shadow_cascades: 4,
            shadow_map_size: 2048,
            safe_mode: false,
            fatal_handler: Arc::new(abort_on_gpu_hang),
        }
    }
}

impl fmt::Debug for RhiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RhiConfig")
            .field("frames_in_flight", &self.frames_in_flight)
            .field("transient_arena_size", &self.transient_arena_size)
            .field("upload_alignment", &self.upload_alignment)
            .field("fence_timeout", &self.fence_timeout)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("shadow_cascades", &self.shadow_cascades)
            .field("shadow_map_size", &self.shadow_map_size)
            .field("safe_mode", &self.safe_mode)
            .finish_non_exhaustive()
    }
}

impl RhiConfig {
    /// Default configuration with the safe-mode toggle read from the process environment.
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Same as [`RhiConfig::from_env`] with an explicit variable lookup.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let safe_mode = lookup(SAFE_MODE_ENV).is_some_and(|value| parse_flag(&value));
        if safe_mode {
            log::warn!("{SAFE_MODE_ENV} is set: uploads are synchronous and the GPU idles after every frame");
        }
        Self {
            safe_mode,
            ..Default::default()
        }
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_transient_arena_size(mut self, size: u64) -> Self {
        self.transient_arena_size = size;
        self
    }

    pub fn with_upload_alignment(mut self, alignment: u64) -> Self {
        self.upload_alignment = alignment;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_shadow_cascades(mut self, cascades: u32, size: u32) -> Self {
        self.shadow_cascades = cascades;
        self.shadow_map_size = size;
        self
    }

    pub fn with_safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    pub fn with_fatal_handler(mut self, handler: impl Fn(&RhiError) + Send + Sync + 'static) -> Self {
        self.fatal_handler = Arc::new(handler);
        self
    }

    /// Reject values the frame scheduler cannot work with.
    pub fn validate(&self) -> RhiResult<()> {
        if self.frames_in_flight == 0 {
            return Err(RhiError::InvalidConfig("frames_in_flight must be at least 1".into()));
        }
        if !self.upload_alignment.is_power_of_two() {
            return Err(RhiError::InvalidConfig(format!(
                "upload_alignment {} is not a power of two",
                self.upload_alignment
            )));
        }
        if self.transient_arena_size == 0 {
            return Err(RhiError::InvalidConfig("transient_arena_size must be non-zero".into()));
        }
        if self.shadow_cascades == 0 || self.shadow_map_size == 0 {
            return Err(RhiError::InvalidConfig("shadow cascades and size must be non-zero".into()));
        }
        if self.shadow_cascades as usize > MAX_SHADOW_CASCADES {
            return Err(RhiError::InvalidConfig(format!(
                "{} shadow cascades requested, at most {MAX_SHADOW_CASCADES} supported",
                self.shadow_cascades
            )));
        }
        if self.fence_timeout.is_zero() {
            return Err(RhiError::InvalidConfig("fence_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn abort_on_gpu_hang(error: &RhiError) {
    log::error!("Unrecoverable GPU state, aborting: {error}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_mode_flag_parsing() {
        for value in ["1", "true", "TRUE", " yes ", "On"] {
            let config = RhiConfig::from_env_with(|_| Some(value.to_owned()));
            assert!(config.safe_mode, "{value:?} should enable safe mode");
        }
        for value in ["0", "false", "", "off", "nope"] {
            let config = RhiConfig::from_env_with(|_| Some(value.to_owned()));
            assert!(!config.safe_mode, "{value:?} should not enable safe mode");
        }
        assert!(!RhiConfig::from_env_with(|_| None).safe_mode);
    }

    #[test]
    fn from_env_only_reads_safe_mode_variable() {
        let config = RhiConfig::from_env_with(|key| (key == SAFE_MODE_ENV).then(|| "1".to_owned()));
        assert!(config.safe_mode);
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.upload_alignment, 256);
        assert_eq!(config.fence_timeout, Duration::from_secs(2));
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(RhiConfig::default().validate().is_ok());
        assert!(RhiConfig::default().with_frames_in_flight(0).validate().is_err());
        assert!(RhiConfig::default().with_upload_alignment(100).validate().is_err());
        assert!(RhiConfig::default().with_transient_arena_size(0).validate().is_err());
        assert!(RhiConfig::default().with_shadow_cascades(0, 1024).validate().is_err());
        assert!(RhiConfig::default().with_shadow_cascades(9, 1024).validate().is_err());
        assert!(RhiConfig::default().with_fence_timeout(Duration::ZERO).validate().is_err());
    }
}
