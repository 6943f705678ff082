//! Core Voronoi mosaic animation library.
//!
//! Selects generator sites from an image biased by brightness, partitions
//! every pixel to its nearest site (CPU bucket-flood or wgpu cone-render
//! backends), colors each cell by the mean of the source pixels it covers,
//! and animates the sites under Ornstein-Uhlenbeck steering with gradual
//! split/merge of the site count.

mod history;
mod rng;
mod sampler;
mod site;
mod voronoi;

#[cfg(feature = "cpu")]
mod cpu;

// The engine needs the CPU backend as its always-available fallback.
#[cfg(feature = "cpu")]
mod engine;

#[cfg(feature = "gpu")]
mod gpu;

#[cfg(feature = "cpu")]
pub use engine::{BackendKind, Engine, StepParams};
pub use history::HistoryRing;
pub use rng::{sub_seed, Mulberry32};
pub use sampler::SiteSampler;
pub use site::{Position, SiteCollection, SplitStrategy, Velocity};
pub use voronoi::{ComputeBackend, VoronoiResult};

#[cfg(feature = "cpu")]
pub use cpu::CpuBackend;

#[cfg(feature = "gpu")]
pub use gpu::GpuBackend;

/// RGB color tuple
pub type Rgb = [u8; 3];

/// Hard cap on the number of sites a collection may hold.
pub const MAX_SITES: usize = 20_000;

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum VoronoiError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    #[error("Allocation failed: {0}")]
    ResourceExhausted(String),

    #[cfg(feature = "gpu")]
    #[error("GPU error: {0}")]
    Gpu(String),
}

pub type Result<T> = std::result::Result<T, VoronoiError>;
