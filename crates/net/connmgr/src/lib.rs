//! Connection manager for a p2p host.
//!
//! Tracks every open peer connection, accrues a per-peer score from static
//! and decaying tags, and closes the lowest-scored peers' connections when
//! the configured high watermark is exceeded.

pub mod config;
pub mod decay;
pub mod manager;
pub mod presets;
pub mod traits;

mod registry;
mod state;

pub use config::{
    ConnManagerConfig, DecayerConfig, DEFAULT_RESOLUTION, DEFAULT_SILENCE_PERIOD,
};
pub use decay::{BumpFn, DecayError, DecayFn, Decayer, DecayingTag, DecayingValue};
pub use manager::{ConnManager, ConnManagerInfo, Notifee};
pub use presets::{
    expire_when_inactive, fixed_decay, linear_decay, no_decay, overwrite, sum_bounded,
    sum_unbounded,
};
pub use state::TagInfo;
pub use traits::{ConnRef, Connection, Notifiee};
