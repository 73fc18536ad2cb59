//! Configuration for the connection manager and the decaying-tag subsystem.

use std::time::Duration;

/// Minimum gap between two successive trims.
pub const DEFAULT_SILENCE_PERIOD: Duration = Duration::from_secs(10);

/// Default tick granularity of the decayer.
pub const DEFAULT_RESOLUTION: Duration = Duration::from_secs(60);

/// How often the background supervisor checks the connection count.
pub(crate) const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(60);

/// Capacity of the bump command queue. Bumps are dropped once it is full.
pub(crate) const BUMP_QUEUE_CAPACITY: usize = 128;

/// Connection manager configuration.
///
/// `low_water` and `high_water` govern the number of connections maintained:
/// once the count exceeds `high_water`, the lowest-scored peers' connections
/// are closed until `low_water` remain. Setting either watermark to zero
/// disables trimming.
#[derive(Debug, Clone)]
pub struct ConnManagerConfig {
    /// Target connection count after a successful trim.
    pub low_water: usize,
    /// Threshold above which the supervisor triggers a trim.
    pub high_water: usize,
    /// Minimum age of a peer before its connections are eligible for trimming.
    pub grace_period: Duration,
    /// Minimum gap between two successive trims.
    pub silence_period: Duration,
    /// Decaying-tag subsystem; disabled when `None`.
    pub decayer: Option<DecayerConfig>,
}

impl Default for ConnManagerConfig {
    fn default() -> Self {
        Self {
            low_water: 160,
            high_water: 192,
            grace_period: Duration::from_secs(30),
            silence_period: DEFAULT_SILENCE_PERIOD,
            decayer: None,
        }
    }
}

impl ConnManagerConfig {
    /// Config with the given watermarks and grace period, defaults elsewhere.
    pub fn new(low_water: usize, high_water: usize, grace_period: Duration) -> Self {
        Self {
            low_water,
            high_water,
            grace_period,
            ..Default::default()
        }
    }

    pub fn with_silence_period(mut self, silence_period: Duration) -> Self {
        self.silence_period = silence_period;
        self
    }

    /// Enables the decaying-tag subsystem.
    pub fn with_decayer(mut self, decayer: DecayerConfig) -> Self {
        self.decayer = Some(decayer);
        self
    }
}

/// Decayer configuration.
#[derive(Debug, Clone)]
pub struct DecayerConfig {
    /// Tick granularity. Decay intervals are normalized to multiples of this.
    pub resolution: Duration,
}

impl Default for DecayerConfig {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
        }
    }
}

impl DecayerConfig {
    pub fn with_resolution(mut self, resolution: Duration) -> Self {
        self.resolution = resolution;
        self
    }
}
