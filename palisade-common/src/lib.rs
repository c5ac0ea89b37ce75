//! Shared types and small utilities used across the palisade crates.

/// Exponential backoff durations for retry loops.
pub mod backoff;
/// The node configuration value object.
pub mod config;
/// On-disk file names and credential store aliases.
pub mod constants;
/// Multi-producer multi-consumer event broadcasting.
pub mod events_bus;
/// Global `tracing` logger setup.
pub mod logger;
/// Serde field helpers.
pub mod serde_helpers;
/// Shutdown signalling.
pub mod shutdown;
/// Named task handles.
pub mod task;
/// X.500 legal names.
pub mod x500;

/// The default size of bounded channels created throughout the codebase.
pub const DEFAULT_CHANNEL_SIZE: usize = 256;
