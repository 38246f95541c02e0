//! Manager configuration snapshot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::ImageError;

/// Default number of decoded images kept in memory.
pub const DEFAULT_MEMORY_CAPACITY: usize = 50;

/// Default interval between expiration sweeps, in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Immutable options a manager is constructed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerOptions {
    /// Pixels per point of delivered images.
    #[serde(default = "default_pixel_scale")]
    pub pixel_scale: f64,

    /// Constrain produced images to the resolved format's target size.
    #[serde(default)]
    pub resize_to_fit: bool,

    /// Disk budget in bytes. `0` means unlimited.
    #[serde(default)]
    pub disk_capacity: u64,

    /// Expiration applied to writes that don't carry their own.
    #[serde(default)]
    pub default_expiration: Option<DateTime<Utc>>,

    /// Decoded images kept in the memory tier.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,

    /// Seconds between expiration sweeps. `0` disables the sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_pixel_scale() -> f64 {
    1.0
}

fn default_memory_capacity() -> usize {
    DEFAULT_MEMORY_CAPACITY
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            pixel_scale: default_pixel_scale(),
            resize_to_fit: false,
            disk_capacity: 0,
            default_expiration: None,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl ManagerOptions {
    /// Sets the pixel scale.
    #[must_use]
    pub fn with_pixel_scale(mut self, scale: f64) -> Self {
        self.pixel_scale = scale;
        self
    }

    /// Enables or disables resizing on fetch.
    #[must_use]
    pub fn with_resize_to_fit(mut self, resize: bool) -> Self {
        self.resize_to_fit = resize;
        self
    }

    /// Sets the disk budget in bytes.
    #[must_use]
    pub fn with_disk_capacity(mut self, bytes: u64) -> Self {
        self.disk_capacity = bytes;
        self
    }

    /// Sets the default expiration date.
    #[must_use]
    pub fn with_default_expiration(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.default_expiration = at;
        self
    }

    /// Sets the memory tier capacity.
    #[must_use]
    pub fn with_memory_capacity(mut self, count: usize) -> Self {
        self.memory_capacity = count;
        self
    }

    /// Sets the sweep interval; zero disables it.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs();
        self
    }

    /// Sweep interval, or `None` when disabled.
    #[must_use]
    pub const fn sweep_interval(&self) -> Option<Duration> {
        if self.sweep_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.sweep_interval_secs))
        }
    }

    /// Checks invariants that serde can't express.
    ///
    /// # Errors
    /// Returns `ImageError::InvalidOptions` if the pixel scale is not positive.
    pub fn validate(&self) -> Result<(), ImageError> {
        if !(self.pixel_scale.is_finite() && self.pixel_scale > 0.0) {
            return Err(ImageError::invalid_options(format!(
                "pixel_scale must be positive, got {}",
                self.pixel_scale
            )));
        }
        Ok(())
    }
}
