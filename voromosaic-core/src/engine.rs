//! The engine owns every other component and coordinates a frame:
//! physics, then any pending count adjustment, then compute, with the
//! position history appended along the way.

use image::RgbaImage;
use tracing::{debug, warn};

use crate::cpu::CpuBackend;
use crate::history::HistoryRing;
use crate::rng::sub_seed;
use crate::sampler::SiteSampler;
use crate::site::{Position, SiteCollection, SplitStrategy};
use crate::voronoi::{ComputeBackend, VoronoiResult};
use crate::{Result, VoronoiError};

#[cfg(feature = "gpu")]
use crate::gpu::GpuBackend;

/// Which compute backend a frame should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Cpu,
    Gpu,
}

/// Per-frame physics parameters.
///
/// `speed` is pixels per second, `dt` seconds, `pull` the centroid-pull
/// strength, `theta` the O-U drift rate, `sigma` the wander magnitude.
#[derive(Debug, Clone, Copy)]
pub struct StepParams {
    pub speed: f64,
    pub dt: f64,
    pub pull: f64,
    pub theta: f64,
    pub sigma: f64,
}

impl StepParams {
    fn validate(&self) -> Result<()> {
        let fields = [
            ("speed", self.speed),
            ("dt", self.dt),
            ("pull", self.pull),
            ("theta", self.theta),
            ("sigma", self.sigma),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(VoronoiError::InvalidConfig(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Pending gradual count transition.
#[derive(Debug, Clone, Copy)]
struct CountTarget {
    target: usize,
    doubling_time: f64,
    strategy: SplitStrategy,
}

/// Single entry point for hosts: owns the image, the sites, the PRNG
/// streams, the backends, and the frame history.
pub struct Engine {
    image: Option<RgbaImage>,
    sites: SiteCollection,
    seed: u32,
    backend_kind: BackendKind,
    cpu: CpuBackend,
    #[cfg(feature = "gpu")]
    gpu: Option<GpuBackend>,
    #[cfg(feature = "gpu")]
    gpu_failed: bool,
    history: HistoryRing,
    pending: Option<CountTarget>,
    last_step: Option<StepParams>,
    last_centroids: Option<Vec<Position>>,
    last_areas: Option<Vec<u32>>,
    last_farthest: Option<Position>,
}

impl Engine {
    pub fn new(seed: u32) -> Self {
        Self::with_backend(seed, BackendKind::Cpu)
    }

    pub fn with_backend(seed: u32, backend_kind: BackendKind) -> Self {
        Self {
            image: None,
            sites: SiteCollection::new(seed),
            seed,
            backend_kind,
            cpu: CpuBackend::new(),
            #[cfg(feature = "gpu")]
            gpu: None,
            #[cfg(feature = "gpu")]
            gpu_failed: false,
            history: HistoryRing::new(0),
            pending: None,
            last_step: None,
            last_centroids: None,
            last_areas: None,
            last_farthest: None,
        }
    }

    /// Backend selection for subsequent computes.
    pub fn set_backend(&mut self, backend_kind: BackendKind) {
        self.backend_kind = backend_kind;
    }

    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    /// Seed of the most recent site initialization.
    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn sites(&self) -> &SiteCollection {
        &self.sites
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.image.as_ref().map(|i| i.dimensions())
    }

    /// Replace the source image. Site positions are preserved (possibly now
    /// out of bounds; the next step clamps them); cached frame statistics
    /// and the history are invalidated.
    pub fn set_image(&mut self, rgba: &[u8], width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(VoronoiError::InvalidConfig("empty image".into()));
        }
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(VoronoiError::InvalidConfig(format!(
                "RGBA buffer length {} does not match {}x{} image",
                rgba.len(),
                width,
                height
            )));
        }

        let mut buffer = Vec::new();
        buffer.try_reserve_exact(expected).map_err(|e| {
            VoronoiError::ResourceExhausted(format!("image buffer: {e}"))
        })?;
        buffer.extend_from_slice(rgba);
        let image = RgbaImage::from_raw(width, height, buffer).ok_or_else(|| {
            VoronoiError::InvalidConfig("RGBA buffer size mismatch".into())
        })?;
        self.image = Some(image);

        self.invalidate_stats();
        self.history.reset(self.sites.xs(), self.sites.ys());
        Ok(())
    }

    /// Re-sample sites from the current image; velocities get fresh random
    /// unit headings and the history is cleared.
    pub fn set_sites_from_sampler(
        &mut self,
        count: usize,
        inverse_bias: bool,
        seed: u32,
    ) -> Result<()> {
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| VoronoiError::InvalidConfig("no image set".into()))?;

        let sampler = SiteSampler::new(count, inverse_bias, sub_seed(seed, 0));
        let positions = sampler.sample(image)?;

        self.seed = seed;
        self.sites = SiteCollection::from_positions(&positions, seed);
        self.after_sites_replaced();
        Ok(())
    }

    /// Adopt explicit positions; velocities get random unit headings seeded
    /// by `seed`.
    pub fn set_sites(&mut self, positions: &[Position], seed: u32) {
        self.seed = seed;
        self.sites = SiteCollection::from_positions(positions, seed);
        self.after_sites_replaced();
    }

    fn after_sites_replaced(&mut self) {
        self.invalidate_stats();
        self.pending = None;
        self.history.reset(self.sites.xs(), self.sites.ys());
    }

    fn invalidate_stats(&mut self) {
        self.last_centroids = None;
        self.last_areas = None;
        self.last_farthest = None;
    }

    /// Advance one frame: physics, then any pending count transition, then
    /// the history append. When the history cursor trails the head this
    /// scrubs forward instead of simulating.
    pub fn step(&mut self, params: StepParams) -> Result<()> {
        params.validate()?;
        let (width, height) = self
            .dimensions()
            .ok_or_else(|| VoronoiError::InvalidConfig("no image set".into()))?;

        if !self.history.at_head() {
            if let Some((xs, ys)) = self.history.step_forward() {
                self.sites.set_positions(xs, ys);
            }
            return Ok(());
        }

        let (w, h) = (width as f64, height as f64);
        // A preceding set_image may have left sites outside the rectangle.
        self.sites.clamp_positions(w, h);
        self.sites.step(
            params.speed,
            params.dt,
            w,
            h,
            self.last_centroids.as_deref(),
            params.pull,
            params.theta,
            params.sigma,
        );
        self.last_step = Some(params);

        let count_changed = self.run_pending_count(params.dt);
        if count_changed {
            // Stored frames describe a different site list; restart the
            // ring from the new head.
            self.history.reset(self.sites.xs(), self.sites.ys());
        } else {
            self.history.record(self.sites.xs(), self.sites.ys());
        }
        Ok(())
    }

    /// Run the pending split/merge budget for this frame, if any.
    /// Returns whether the site count changed.
    fn run_pending_count(&mut self, dt: f64) -> bool {
        let Some(pending) = self.pending else {
            return false;
        };

        let (added, removed) = self.sites.adjust_count(
            pending.target,
            pending.doubling_time,
            dt,
            self.last_areas.as_deref(),
            pending.strategy,
            self.last_farthest,
        );

        if !removed.is_empty() {
            // Merges shift indices; cached per-cell data no longer lines up.
            self.invalidate_stats();
        }
        if self.sites.len() == pending.target {
            self.pending = None;
        }
        !added.is_empty() || !removed.is_empty()
    }

    /// Register a count target and immediately run one controller pass
    /// against the current frame's cell areas.
    pub fn adjust_count(
        &mut self,
        target: usize,
        doubling_time: f64,
        dt: f64,
        strategy: SplitStrategy,
    ) -> Result<()> {
        for (name, value) in [("doubling_time", doubling_time), ("dt", dt)] {
            if !value.is_finite() || value < 0.0 {
                return Err(VoronoiError::InvalidConfig(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        self.set_count_target(target, doubling_time, strategy);
        if self.run_pending_count(dt) {
            self.history.reset(self.sites.xs(), self.sites.ys());
        }
        Ok(())
    }

    /// Register a count target to be progressed on each subsequent step.
    pub fn set_count_target(
        &mut self,
        target: usize,
        doubling_time: f64,
        strategy: SplitStrategy,
    ) {
        self.pending = Some(CountTarget {
            target: target.clamp(1, crate::MAX_SITES),
            doubling_time,
            strategy,
        });
    }

    /// Compute the Voronoi frame for the current sites and image.
    ///
    /// Fails when the image is unset or there are no sites. With the GPU
    /// backend selected, initialization failure is reported once and the
    /// session falls back to the CPU.
    pub fn compute(&mut self) -> Result<VoronoiResult> {
        if self.sites.is_empty() {
            return Err(VoronoiError::InvalidConfig("no sites to compute".into()));
        }
        let positions = self.sites.positions();

        #[cfg(feature = "gpu")]
        if self.backend_kind == BackendKind::Gpu && !self.gpu_failed {
            if self.gpu.is_none() {
                match GpuBackend::new() {
                    Ok(gpu) => self.gpu = Some(gpu),
                    Err(e) => {
                        self.gpu_failed = true;
                        warn!("GPU initialization failed: {e}; falling back to CPU");
                    }
                }
            }
            if let Some(gpu) = self.gpu.as_mut() {
                let image = self
                    .image
                    .as_ref()
                    .ok_or_else(|| VoronoiError::InvalidConfig("no image set".into()))?;
                let result = gpu.compute(image, &positions)?;
                self.cache_stats(&result);
                return Ok(result);
            }
        }

        #[cfg(not(feature = "gpu"))]
        if self.backend_kind == BackendKind::Gpu {
            // Built without GPU support; warn once per engine by reusing
            // the kind as the latch.
            warn!("GPU backend requested but not compiled in; using CPU");
            self.backend_kind = BackendKind::Cpu;
        }

        let image = self
            .image
            .as_ref()
            .ok_or_else(|| VoronoiError::InvalidConfig("no image set".into()))?;
        let result = self.cpu.compute(image, &positions)?;
        self.cache_stats(&result);
        Ok(result)
    }

    fn cache_stats(&mut self, result: &VoronoiResult) {
        self.last_centroids = Some(result.cell_centroids.clone());
        self.last_areas = Some(result.cell_areas.clone());
        self.last_farthest = Some(result.farthest_point);
        debug!(
            sites = self.sites.len(),
            farthest_x = result.farthest_point.x,
            farthest_y = result.farthest_point.y,
            "frame computed"
        );
    }

    /// Move one frame back in history; returns whether the cursor moved.
    pub fn step_back(&mut self) -> bool {
        if let Some((xs, ys)) = self.history.step_back() {
            self.sites.set_positions(xs, ys);
            true
        } else {
            false
        }
    }

    /// Move one frame forward. Behind the head this replays the stored
    /// frame; at the head it advances physics with the last step's
    /// parameters. Returns whether anything moved.
    pub fn step_forward(&mut self) -> Result<bool> {
        if let Some((xs, ys)) = self.history.step_forward() {
            self.sites.set_positions(xs, ys);
            return Ok(true);
        }
        match self.last_step {
            Some(params) => {
                self.step(params)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_rgba(width: u32, height: u32) -> Vec<u8> {
        vec![128; (width * height * 4) as usize]
    }

    fn ready_engine(width: u32, height: u32, count: usize) -> Engine {
        let mut engine = Engine::new(0);
        engine
            .set_image(&gray_rgba(width, height), width, height)
            .unwrap();
        engine.set_sites_from_sampler(count, false, 0).unwrap();
        engine
    }

    #[test]
    fn compute_without_image_fails() {
        let mut engine = Engine::new(0);
        engine.set_sites(&[Position::new(1.0, 1.0)], 0);
        assert!(matches!(
            engine.compute(),
            Err(VoronoiError::InvalidConfig(_))
        ));
    }

    #[test]
    fn compute_without_sites_fails() {
        let mut engine = Engine::new(0);
        engine.set_image(&gray_rgba(4, 4), 4, 4).unwrap();
        assert!(matches!(
            engine.compute(),
            Err(VoronoiError::InvalidConfig(_))
        ));
    }

    #[test]
    fn sampler_rejects_oversized_count() {
        let mut engine = Engine::new(0);
        engine.set_image(&gray_rgba(4, 4), 4, 4).unwrap();
        assert!(engine.set_sites_from_sampler(17, false, 0).is_err());
    }

    #[test]
    fn set_image_validates_buffer() {
        let mut engine = Engine::new(0);
        assert!(engine.set_image(&[0u8; 12], 2, 2).is_err());
        assert!(engine.set_image(&[], 0, 0).is_err());
        assert!(engine.set_image(&gray_rgba(2, 2), 2, 2).is_ok());
    }

    #[test]
    fn step_rejects_negative_parameters() {
        let mut engine = ready_engine(8, 8, 4);
        let bad = StepParams {
            speed: 10.0,
            dt: -0.1,
            pull: 0.0,
            theta: 0.0,
            sigma: 0.0,
        };
        assert!(engine.step(bad).is_err());
    }

    #[test]
    fn frame_loop_runs_and_partitions_image() {
        let mut engine = ready_engine(16, 16, 5);
        let params = StepParams {
            speed: 10.0,
            dt: 1.0 / 30.0,
            pull: 0.0,
            theta: 1.0,
            sigma: 1.0,
        };
        for _ in 0..10 {
            engine.step(params).unwrap();
            let result = engine.compute().unwrap();
            assert_eq!(result.cell_areas.iter().sum::<u32>(), 256);
        }
    }

    #[test]
    fn gradual_count_change_progresses_with_steps() {
        let mut engine = ready_engine(32, 32, 10);
        engine.compute().unwrap();
        engine
            .adjust_count(20, 0.5, 0.0, SplitStrategy::Max)
            .unwrap();

        let params = StepParams {
            speed: 5.0,
            dt: 0.05,
            pull: 0.0,
            theta: 0.0,
            sigma: 1.0,
        };
        for _ in 0..200 {
            engine.step(params).unwrap();
            engine.compute().unwrap();
            if engine.site_count() == 20 {
                break;
            }
        }
        assert_eq!(engine.site_count(), 20);
    }

    #[test]
    fn immediate_count_change_with_zero_doubling_time() {
        let mut engine = ready_engine(32, 32, 10);
        engine.compute().unwrap();
        engine
            .adjust_count(4, 0.0, 0.0, SplitStrategy::Max)
            .unwrap();
        assert_eq!(engine.site_count(), 4);
    }

    #[test]
    fn history_scrub_restores_positions() {
        let mut engine = ready_engine(16, 16, 3);
        let params = StepParams {
            speed: 20.0,
            dt: 0.1,
            pull: 0.0,
            theta: 0.0,
            sigma: 2.0,
        };
        let mut trail = vec![];
        for _ in 0..5 {
            engine.step(params).unwrap();
            trail.push((engine.sites().xs().to_vec(), engine.sites().ys().to_vec()));
        }

        assert!(engine.step_back());
        assert!(engine.step_back());
        assert_eq!(engine.sites().xs(), trail[2].0.as_slice());

        assert!(engine.step_forward().unwrap());
        assert_eq!(engine.sites().xs(), trail[3].0.as_slice());
        assert!(engine.step_forward().unwrap());
        assert_eq!(engine.sites().xs(), trail[4].0.as_slice());
    }

    #[test]
    fn step_back_at_start_is_a_no_op() {
        let mut engine = ready_engine(8, 8, 2);
        assert!(!engine.step_back());
    }

    #[test]
    fn image_change_keeps_sites_and_clamps_on_step() {
        let mut engine = ready_engine(32, 32, 4);
        engine.set_image(&gray_rgba(8, 8), 8, 8).unwrap();
        assert_eq!(engine.site_count(), 4);

        engine
            .step(StepParams {
                speed: 1.0,
                dt: 0.01,
                pull: 0.0,
                theta: 0.0,
                sigma: 0.0,
            })
            .unwrap();
        for i in 0..engine.site_count() {
            let p = engine.sites().position(i);
            assert!(p.x >= 0.0 && p.x < 8.0);
            assert!(p.y >= 0.0 && p.y < 8.0);
        }
    }
}
