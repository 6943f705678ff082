//! CPU Voronoi backend: bucket-queue jump flood.
//!
//! A Dijkstra-style expansion over the pixel grid with integer-bucketed
//! priorities. Each site seeds its home pixel; pixels are popped in
//! nondecreasing floor(dist^2) order and relax their 4-connected neighbors
//! with the true squared Euclidean distance to the owning site. The squared
//! distance is monotone along any monotone path away from a site, so the
//! 4-connected expansion yields exact L2 Voronoi at grid resolution (ties
//! resolved within one bucket).
//!
//! The flood itself runs on a single monotone cursor; the per-cell
//! statistics pass afterwards is strip-parallel (see `accumulate_cells`).

use image::RgbaImage;
use tracing::trace;

use crate::voronoi::{accumulate_cells, ComputeBackend};
use crate::{Position, Result, VoronoiError, VoronoiResult};

/// CPU backend with scratch buffers reused across frames.
pub struct CpuBackend {
    /// Best squared distance seen per pixel.
    best_dist: Vec<f64>,
    /// `buckets[k]` holds `(pixel, site)` entries with floor(dist^2) == k.
    /// Buckets are cleared as the cursor passes them, so capacity persists
    /// across frames.
    buckets: Vec<Vec<(u32, u32)>>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            best_dist: Vec::new(),
            buckets: Vec::new(),
        }
    }

    /// Grow `best_dist` to `num_pixels` and reset it, reporting allocation
    /// failure instead of aborting.
    fn reset_scratch(&mut self, num_pixels: usize) -> Result<()> {
        if self.best_dist.capacity() < num_pixels {
            let extra = num_pixels - self.best_dist.capacity();
            self.best_dist.try_reserve_exact(extra).map_err(|e| {
                VoronoiError::ResourceExhausted(format!(
                    "distance buffer ({num_pixels} pixels): {e}"
                ))
            })?;
        }
        self.best_dist.clear();
        self.best_dist.resize(num_pixels, f64::INFINITY);
        Ok(())
    }

    #[inline]
    fn push(&mut self, key: usize, max_key: usize, cursor: usize, pixel: u32, site: u32) {
        // The cursor never moves backward; a key below it would be lost.
        let key = key.min(max_key).max(cursor);
        if key >= self.buckets.len() {
            self.buckets.resize_with(key + 1, Vec::new);
        }
        self.buckets[key].push((pixel, site));
    }

    fn flood(
        &mut self,
        width: usize,
        height: usize,
        sites: &[Position],
    ) -> Result<Vec<i32>> {
        let num_pixels = width * height;
        let max_key = width * width + height * height;
        self.reset_scratch(num_pixels)?;

        let mut cell_of: Vec<i32> = Vec::new();
        cell_of.try_reserve_exact(num_pixels).map_err(|e| {
            VoronoiError::ResourceExhausted(format!(
                "cell buffer ({num_pixels} pixels): {e}"
            ))
        })?;
        cell_of.resize(num_pixels, -1);

        // Seed: each site claims a slot at its home pixel. Pushes that are
        // not strictly better than the current best are dropped, so equal
        // seeds resolve to the lowest site index.
        for (i, site) in sites.iter().enumerate() {
            let hx = (site.x.floor().max(0.0) as usize).min(width - 1);
            let hy = (site.y.floor().max(0.0) as usize).min(height - 1);
            let pixel = (hy * width + hx) as u32;
            let d = pixel_dist_sq(hx, hy, site);
            if d < self.best_dist[pixel as usize] {
                self.best_dist[pixel as usize] = d;
                self.push(d as usize, max_key, 0, pixel, i as u32);
            }
        }

        let mut cursor = 0;
        let mut popped = 0u64;
        while cursor < self.buckets.len() {
            let mut k = 0;
            // Entries may be appended to the current bucket while it is
            // being drained; re-read the length each iteration.
            while k < self.buckets[cursor].len() {
                let (pixel, site) = self.buckets[cursor][k];
                k += 1;
                popped += 1;

                let p = pixel as usize;
                if cell_of[p] >= 0 {
                    continue;
                }
                cell_of[p] = site as i32;

                let x = p % width;
                let y = p / width;
                let s = &sites[site as usize];

                let relax = |this: &mut Self, nx: usize, ny: usize| {
                    let q = ny * width + nx;
                    if cell_of[q] >= 0 {
                        return;
                    }
                    let d = pixel_dist_sq(nx, ny, s);
                    if d < this.best_dist[q] {
                        this.best_dist[q] = d;
                        this.push(d as usize, max_key, cursor, q as u32, site);
                    }
                };
                if x > 0 {
                    relax(&mut *self, x - 1, y);
                }
                if x + 1 < width {
                    relax(&mut *self, x + 1, y);
                }
                if y > 0 {
                    relax(&mut *self, x, y - 1);
                }
                if y + 1 < height {
                    relax(&mut *self, x, y + 1);
                }
            }
            self.buckets[cursor].clear();
            cursor += 1;
        }

        trace!(popped, sites = sites.len(), "bucket flood complete");
        Ok(cell_of)
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Squared distance from the center of pixel `(x, y)` to a site.
#[inline]
fn pixel_dist_sq(x: usize, y: usize, site: &Position) -> f64 {
    let dx = x as f64 + 0.5 - site.x;
    let dy = y as f64 + 0.5 - site.y;
    dx * dx + dy * dy
}

impl ComputeBackend for CpuBackend {
    fn compute(
        &mut self,
        image: &RgbaImage,
        sites: &[Position],
    ) -> Result<VoronoiResult> {
        if sites.is_empty() {
            return Err(VoronoiError::InvalidConfig("no sites provided".into()));
        }
        let width = image.width() as usize;
        let height = image.height() as usize;
        if width == 0 || height == 0 {
            return Err(VoronoiError::InvalidConfig("empty image".into()));
        }

        let cell_of = self.flood(width, height, sites)?;
        Ok(accumulate_cells(image, cell_of, sites))
    }
}
