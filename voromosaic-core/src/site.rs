//! Site types, physics stepping, and gradual count adjustment.
//!
//! Positions and velocities live in parallel arrays (`xs`/`ys`/`vxs`/`vys`)
//! so the physics and compute paths stream through contiguous memory.
//! Velocities are unit-length headings; speed is a scalar applied at step
//! time.

use std::f64::consts::LN_2;
use std::str::FromStr;

use crate::rng::{sub_seed, Mulberry32};
use crate::MAX_SITES;

/// Sites near a wall are kept strictly inside `[0, limit)`.
const WALL_MARGIN: f64 = 1e-9;

/// 2D position in continuous image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared distance to another position
    pub fn dist_sq(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    /// Distance to another position
    pub fn dist(&self, other: &Position) -> f64 {
        self.dist_sq(other).sqrt()
    }
}

/// Unit velocity vector (magnitude 1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Velocity {
    pub x: f64,
    pub y: f64,
}

impl Velocity {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Create from angle in radians
    pub fn from_angle(angle: f64) -> Self {
        Self {
            x: angle.cos(),
            y: angle.sin(),
        }
    }
}

/// How the split source site is chosen while growing the count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitStrategy {
    /// Split the site with the largest cell area (once per site per call).
    #[default]
    Max,
    /// Insert the new site at the farthest unowned pixel.
    Far,
    /// Split a uniformly random site.
    Random,
}

impl FromStr for SplitStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "max" => Ok(SplitStrategy::Max),
            "far" => Ok(SplitStrategy::Far),
            "random" => Ok(SplitStrategy::Random),
            other => Err(format!("unknown split strategy: {other}")),
        }
    }
}

/// Ordered collection of sites with physics simulation.
///
/// Index order is the identity of a cell across frames: splits append the
/// child at the end, merges remove one index and shift the tail down.
#[derive(Debug, Clone)]
pub struct SiteCollection {
    xs: Vec<f64>,
    ys: Vec<f64>,
    vxs: Vec<f64>,
    vys: Vec<f64>,
    /// Accumulated fractional sites for gradual growth/shrink.
    fractional_sites: f64,
    rng: Mulberry32,
}

impl SiteCollection {
    /// Empty collection; `seed` keys the physics stream.
    pub fn new(seed: u32) -> Self {
        Self {
            xs: Vec::new(),
            ys: Vec::new(),
            vxs: Vec::new(),
            vys: Vec::new(),
            fractional_sites: 0.0,
            rng: Mulberry32::new(sub_seed(seed, 2)),
        }
    }

    /// Adopt positions; velocities get random unit headings.
    ///
    /// Streams are derived from `seed`: velocity initialization and physics
    /// noise are independent, so identical seeds replay identically.
    pub fn from_positions(positions: &[Position], seed: u32) -> Self {
        let mut vel_rng = Mulberry32::new(sub_seed(seed, 1));
        let mut collection = Self::new(seed);
        for p in positions {
            let v = Velocity::from_angle(vel_rng.next_angle());
            collection.push_site(*p, v);
        }
        collection
    }

    /// Uniform random positions with random headings.
    pub fn random(count: usize, width: f64, height: f64, seed: u32) -> Self {
        let mut pos_rng = Mulberry32::new(sub_seed(seed, 0));
        let positions: Vec<Position> = (0..count)
            .map(|_| {
                Position::new(
                    pos_rng.next_f64() * width,
                    pos_rng.next_f64() * height,
                )
            })
            .collect();
        Self::from_positions(&positions, seed)
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    pub fn position(&self, i: usize) -> Position {
        Position::new(self.xs[i], self.ys[i])
    }

    pub fn velocity(&self, i: usize) -> Velocity {
        Velocity::new(self.vxs[i], self.vys[i])
    }

    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    /// Positions as a contiguous list (for Voronoi computation).
    pub fn positions(&self) -> Vec<Position> {
        self.xs
            .iter()
            .zip(&self.ys)
            .map(|(&x, &y)| Position::new(x, y))
            .collect()
    }

    /// Overwrite positions in place (history scrubbing). Lengths must match.
    pub fn set_positions(&mut self, xs: &[f64], ys: &[f64]) {
        assert_eq!(xs.len(), self.len());
        self.xs.copy_from_slice(xs);
        self.ys.copy_from_slice(ys);
    }

    /// Clamp every site into `[0, width) x [0, height)`.
    pub fn clamp_positions(&mut self, width: f64, height: f64) {
        for x in &mut self.xs {
            *x = x.clamp(0.0, width - WALL_MARGIN);
        }
        for y in &mut self.ys {
            *y = y.clamp(0.0, height - WALL_MARGIN);
        }
    }

    fn push_site(&mut self, pos: Position, vel: Velocity) {
        self.xs.push(pos.x);
        self.ys.push(pos.y);
        self.vxs.push(vel.x);
        self.vys.push(vel.y);
    }

    fn remove_site(&mut self, idx: usize) {
        self.xs.remove(idx);
        self.ys.remove(idx);
        self.vxs.remove(idx);
        self.vys.remove(idx);
    }

    /// Advance all sites by `dt` seconds.
    ///
    /// Headings evolve as an Ornstein-Uhlenbeck process: a drift of strength
    /// `pull * theta` toward the previous frame's cell centroid, plus
    /// Gaussian wander of strength `sigma` perpendicular to the heading.
    /// Positions then move `speed * dt` along the heading, mirror-reflecting
    /// off the image walls.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        speed: f64,
        dt: f64,
        width: f64,
        height: f64,
        centroids: Option<&[Position]>,
        pull: f64,
        theta: f64,
        sigma: f64,
    ) {
        let movement = speed * dt;
        let sqrt_dt = dt.sqrt();
        let wander = sigma > 0.0 && dt > 0.0;

        for i in 0..self.len() {
            let (vx0, vy0) = (self.vxs[i], self.vys[i]);
            let mut vx = vx0;
            let mut vy = vy0;

            // Drift toward the cell centroid. Absent a target the mean of
            // the process is the current heading, so the term vanishes.
            if pull > 0.0 && theta > 0.0 {
                if let Some(c) = centroids.and_then(|c| c.get(i)) {
                    let dx = c.x - self.xs[i];
                    let dy = c.y - self.ys[i];
                    let dist = (dx * dx + dy * dy).sqrt();
                    if dist > f64::EPSILON {
                        let k = pull * theta * dt;
                        vx += k * (dx / dist - vx0);
                        vy += k * (dy / dist - vy0);
                    }
                }
            }

            // Wander: normal kick scaled by sqrt(dt), perpendicular to the
            // pre-update heading.
            if wander {
                let kick = sigma * self.rng.next_normal() * sqrt_dt;
                vx += kick * -vy0;
                vy += kick * vx0;
            }

            let norm = (vx * vx + vy * vy).sqrt();
            if norm > f64::EPSILON {
                vx /= norm;
                vy /= norm;
            } else {
                vx = vx0;
                vy = vy0;
            }
            self.vxs[i] = vx;
            self.vys[i] = vy;

            let nx = self.xs[i] + vx * movement;
            let ny = self.ys[i] + vy * movement;
            self.xs[i] = match reflect(nx, width) {
                Some(rx) => {
                    self.vxs[i] = -self.vxs[i];
                    rx
                }
                None => nx,
            };
            self.ys[i] = match reflect(ny, height) {
                Some(ry) => {
                    self.vys[i] = -self.vys[i];
                    ry
                }
                None => ny,
            };
        }
    }

    /// Gradually adjust site count toward `target`.
    ///
    /// Sites accrue fractionally at `N * ln(2) / doubling_time` per second;
    /// each whole unit performs one split or merge. `doubling_time = 0`
    /// performs the entire transition at once.
    ///
    /// Returns indices of newly added sites and of removed sites (removal
    /// indices are as seen at removal time; later indices shift down).
    pub fn adjust_count(
        &mut self,
        target: usize,
        doubling_time: f64,
        dt: f64,
        cell_areas: Option<&[u32]>,
        strategy: SplitStrategy,
        farthest: Option<Position>,
    ) -> (Vec<usize>, Vec<usize>) {
        let target = target.clamp(1, MAX_SITES);
        let mut added = vec![];
        let mut removed = vec![];
        // Sources already split during this call; a site splits at most
        // once per frame.
        let mut split_sources: Vec<usize> = vec![];

        if target == self.len() || self.is_empty() {
            return (added, removed);
        }

        if doubling_time <= 0.0 {
            // Batch transition, no accumulator.
            while self.len() < target {
                let child =
                    self.split_one(strategy, cell_areas, farthest, &mut split_sources);
                added.push(child);
            }
            while self.len() > target {
                let idx = self.find_densest_site();
                self.remove_site(idx);
                removed.push(idx);
            }
            self.fractional_sites = 0.0;
            return (added, removed);
        }

        let rate = LN_2 / doubling_time;
        self.fractional_sites += self.len() as f64 * rate * dt;

        while self.fractional_sites >= 1.0 && self.len() != target {
            self.fractional_sites -= 1.0;
            if self.len() < target {
                let child =
                    self.split_one(strategy, cell_areas, farthest, &mut split_sources);
                added.push(child);
            } else {
                let idx = self.find_densest_site();
                self.remove_site(idx);
                removed.push(idx);
            }
        }

        if self.len() == target {
            self.fractional_sites = 0.0;
        }

        (added, removed)
    }

    /// Perform one split; returns the child's index.
    fn split_one(
        &mut self,
        strategy: SplitStrategy,
        cell_areas: Option<&[u32]>,
        farthest: Option<Position>,
        split_sources: &mut Vec<usize>,
    ) -> usize {
        match strategy {
            SplitStrategy::Far => {
                if let Some(p) = farthest {
                    // The new site claims the emptiest spot outright; the
                    // spot's owner keeps its position and heading.
                    let v = Velocity::from_angle(self.rng.next_angle());
                    self.push_site(p, v);
                    return self.len() - 1;
                }
                let src = self.rng.next_index(self.len());
                self.split_site(src, split_sources)
            }
            SplitStrategy::Random => {
                let src = self.rng.next_index(self.len());
                self.split_site(src, split_sources)
            }
            SplitStrategy::Max => {
                match self.pick_largest_unsplit(cell_areas, split_sources) {
                    Some(src) => self.split_site(src, split_sources),
                    None => {
                        let src = self.rng.next_index(self.len());
                        self.split_site(src, split_sources)
                    }
                }
            }
        }
    }

    /// Largest-area site that was not already a split source this call.
    /// Ties break toward the lowest index. Children appended this call sit
    /// past the end of `cell_areas` and are excluded naturally.
    fn pick_largest_unsplit(
        &self,
        cell_areas: Option<&[u32]>,
        split_sources: &[usize],
    ) -> Option<usize> {
        let areas = cell_areas?;
        let mut best: Option<(u32, usize)> = None;
        for (i, &area) in areas.iter().enumerate().take(self.len()) {
            if split_sources.contains(&i) {
                continue;
            }
            match best {
                Some((b, _)) if area <= b => {}
                _ => best = Some((area, i)),
            }
        }
        best.map(|(_, i)| i)
    }

    /// Split `src` into two co-located sites with opposing headings.
    /// The child is appended; returns its index.
    fn split_site(&mut self, src: usize, split_sources: &mut Vec<usize>) -> usize {
        let angle = self.rng.next_angle();
        let v = Velocity::from_angle(angle);
        let pos = self.position(src);
        self.vxs[src] = v.x;
        self.vys[src] = v.y;
        self.push_site(pos, Velocity::new(-v.x, -v.y));
        split_sources.push(src);
        self.len() - 1
    }

    /// Site whose nearest neighbor is closest (densest-packed).
    ///
    /// Above 100 sites, scans a random subset of 100 removal candidates;
    /// each candidate is still compared against every site.
    fn find_densest_site(&mut self) -> usize {
        let n = self.len();
        if n <= 1 {
            return 0;
        }

        let full_scan = n <= 100;
        let candidates = if full_scan { n } else { 100 };

        let mut min_closest = f64::INFINITY;
        let mut remove_idx = 0;

        for c in 0..candidates {
            let idx = if full_scan { c } else { self.rng.next_index(n) };
            let (sx, sy) = (self.xs[idx], self.ys[idx]);

            let mut closest = f64::INFINITY;
            for j in 0..n {
                if j == idx {
                    continue;
                }
                let dx = self.xs[j] - sx;
                let dy = self.ys[j] - sy;
                let d = dx * dx + dy * dy;
                if d < closest {
                    closest = d;
                }
            }

            if closest < min_closest {
                min_closest = closest;
                remove_idx = idx;
            }
        }

        remove_idx
    }
}

/// Mirror a coordinate that left `[0, limit)` back inside; `None` when it
/// did not leave.
fn reflect(p: f64, limit: f64) -> Option<f64> {
    if p < 0.0 {
        Some((-p).clamp(0.0, limit - WALL_MARGIN))
    } else if p >= limit {
        Some((2.0 * limit - p).clamp(0.0, limit - WALL_MARGIN))
    } else {
        None
    }
}
