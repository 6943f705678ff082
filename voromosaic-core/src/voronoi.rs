//! Voronoi computation traits, result types, and the shared per-cell
//! accumulation pass.

use image::RgbaImage;
use rayon::prelude::*;

use crate::{Position, Result, Rgb};

/// Result of Voronoi computation
#[derive(Debug, Clone)]
pub struct VoronoiResult {
    /// Cell index for each pixel (row-major order)
    pub cell_of: Vec<i32>,
    /// Average color for each cell
    pub cell_colors: Vec<Rgb>,
    /// Area (pixel count) for each cell
    pub cell_areas: Vec<u32>,
    /// Mean pixel-center position for each cell
    pub cell_centroids: Vec<Position>,
    /// Pixel center maximally distant from its nearest site
    pub farthest_point: Position,
    /// Image dimensions
    pub width: u32,
    pub height: u32,
}

impl VoronoiResult {
    /// Render the Voronoi diagram to an RGB pixel buffer
    pub fn render(&self) -> Vec<u8> {
        let mut pixels = vec![0u8; (self.width * self.height * 3) as usize];

        for (i, &cell) in self.cell_of.iter().enumerate() {
            if cell >= 0 && (cell as usize) < self.cell_colors.len() {
                let color = self.cell_colors[cell as usize];
                let px = i * 3;
                pixels[px] = color[0];
                pixels[px + 1] = color[1];
                pixels[px + 2] = color[2];
            }
        }

        pixels
    }

    /// Render to an image::RgbImage
    pub fn to_image(&self) -> image::RgbImage {
        let pixels = self.render();
        image::RgbImage::from_raw(self.width, self.height, pixels)
            .expect("Buffer size mismatch")
    }
}

/// Trait for Voronoi computation backends
pub trait ComputeBackend {
    /// Compute a frame: assign every pixel of `image` to its nearest site
    /// and derive per-cell statistics.
    fn compute(
        &mut self,
        image: &RgbaImage,
        sites: &[Position],
    ) -> Result<VoronoiResult>;
}

/// Per-strip accumulator for the parallel statistics pass
struct RowAccum {
    r_sums: Vec<u64>,
    g_sums: Vec<u64>,
    b_sums: Vec<u64>,
    x_sums: Vec<u64>,
    y_sums: Vec<u64>,
    areas: Vec<u32>,
    farthest_pos: Position,
    farthest_dist: f64,
}

impl RowAccum {
    fn new(num_sites: usize) -> Self {
        Self {
            r_sums: vec![0u64; num_sites],
            g_sums: vec![0u64; num_sites],
            b_sums: vec![0u64; num_sites],
            x_sums: vec![0u64; num_sites],
            y_sums: vec![0u64; num_sites],
            areas: vec![0u32; num_sites],
            farthest_pos: Position::new(0.0, 0.0),
            farthest_dist: -1.0,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        let n = self.r_sums.len();
        for i in 0..n {
            self.r_sums[i] += other.r_sums[i];
            self.g_sums[i] += other.g_sums[i];
            self.b_sums[i] += other.b_sums[i];
            self.x_sums[i] += other.x_sums[i];
            self.y_sums[i] += other.y_sums[i];
            self.areas[i] += other.areas[i];
        }
        if other.farthest_dist > self.farthest_dist {
            self.farthest_pos = other.farthest_pos;
            self.farthest_dist = other.farthest_dist;
        }
        self
    }
}

/// Derive per-cell color means, areas, centroids, and the farthest point
/// from a finished `cell_of` assignment.
///
/// Shared by both backends; parallel over horizontal image strips, joined
/// before returning. Empty cells fall back to the source pixel under the
/// site (mid-gray when the site is out of bounds).
pub(crate) fn accumulate_cells(
    image: &RgbaImage,
    cell_of: Vec<i32>,
    sites: &[Position],
) -> VoronoiResult {
    let width = image.width();
    let height = image.height();
    let num_sites = sites.len();
    let raw = image.as_raw();
    let cell_ref = &cell_of;

    let accum = (0..height)
        .into_par_iter()
        .fold(
            || RowAccum::new(num_sites),
            |mut acc, y| {
                let py = y as f64 + 0.5;
                let row_offset = (y * width) as usize;

                for x in 0..width as usize {
                    let i = row_offset + x;
                    let cell = cell_ref[i] as usize;
                    let px_offset = i * 4;
                    acc.r_sums[cell] += raw[px_offset] as u64;
                    acc.g_sums[cell] += raw[px_offset + 1] as u64;
                    acc.b_sums[cell] += raw[px_offset + 2] as u64;
                    acc.x_sums[cell] += x as u64;
                    acc.y_sums[cell] += y as u64;
                    acc.areas[cell] += 1;

                    let px = x as f64 + 0.5;
                    let dx = px - sites[cell].x;
                    let dy = py - sites[cell].y;
                    let dist = dx * dx + dy * dy;
                    if dist > acc.farthest_dist {
                        acc.farthest_dist = dist;
                        acc.farthest_pos = Position::new(px, py);
                    }
                }
                acc
            },
        )
        .reduce(|| RowAccum::new(num_sites), RowAccum::merge);

    let mut cell_colors: Vec<Rgb> = Vec::with_capacity(num_sites);
    let mut cell_centroids: Vec<Position> = Vec::with_capacity(num_sites);
    for i in 0..num_sites {
        let count = accum.areas[i] as u64;
        if count > 0 {
            cell_colors.push([
                (accum.r_sums[i] / count) as u8,
                (accum.g_sums[i] / count) as u8,
                (accum.b_sums[i] / count) as u8,
            ]);
            // Sums are over pixel corners; +0.5 recenters on pixel squares.
            cell_centroids.push(Position::new(
                accum.x_sums[i] as f64 / count as f64 + 0.5,
                accum.y_sums[i] as f64 / count as f64 + 0.5,
            ));
        } else {
            cell_colors.push(site_fallback_color(image, sites[i]));
            cell_centroids.push(sites[i]);
        }
    }

    VoronoiResult {
        cell_of,
        cell_colors,
        cell_areas: accum.areas,
        cell_centroids,
        farthest_point: accum.farthest_pos,
        width,
        height,
    }
}

/// Source pixel under the site, or mid-gray when out of bounds.
fn site_fallback_color(image: &RgbaImage, site: Position) -> Rgb {
    let (x, y) = (site.x.floor(), site.y.floor());
    if x >= 0.0 && y >= 0.0 && (x as u32) < image.width() && (y as u32) < image.height() {
        let p = image.get_pixel(x as u32, y as u32);
        [p[0], p[1], p[2]]
    } else {
        [128, 128, 128]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_two_pixel_image() {
        let mut image = RgbaImage::new(2, 1);
        image.put_pixel(0, 0, image::Rgba([0, 0, 0, 255]));
        image.put_pixel(1, 0, image::Rgba([255, 255, 255, 255]));

        let sites = [Position::new(0.5, 0.5), Position::new(1.5, 0.5)];
        let result = accumulate_cells(&image, vec![0, 1], &sites);

        assert_eq!(result.cell_areas, vec![1, 1]);
        assert_eq!(result.cell_colors, vec![[0, 0, 0], [255, 255, 255]]);
        assert_eq!(result.cell_centroids[0], Position::new(0.5, 0.5));
        assert_eq!(result.cell_centroids[1], Position::new(1.5, 0.5));
        // Both pixels sit exactly on their sites; farthest distance is 0.
        assert_eq!(result.farthest_point, Position::new(0.5, 0.5));
    }

    #[test]
    fn empty_cell_falls_back_to_site_pixel() {
        let image = RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 255]));
        // Site 1 owns nothing.
        let sites = [Position::new(1.0, 1.0), Position::new(0.0, 0.0)];
        let result = accumulate_cells(&image, vec![0, 0, 0, 0], &sites);

        assert_eq!(result.cell_areas, vec![4, 0]);
        assert_eq!(result.cell_colors[1], [10, 20, 30]);
        assert_eq!(result.cell_centroids[1], sites[1]);
    }

    #[test]
    fn out_of_bounds_empty_cell_is_mid_gray() {
        let image = RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 255]));
        let sites = [Position::new(1.0, 1.0), Position::new(50.0, 50.0)];
        let result = accumulate_cells(&image, vec![0, 0, 0, 0], &sites);
        assert_eq!(result.cell_colors[1], [128, 128, 128]);
    }

    #[test]
    fn render_paints_cell_colors() {
        let result = VoronoiResult {
            cell_of: vec![0, 1, 1, 0],
            cell_colors: vec![[255, 0, 0], [0, 0, 255]],
            cell_areas: vec![2, 2],
            cell_centroids: vec![Position::new(0.0, 0.0); 2],
            farthest_point: Position::new(0.0, 0.0),
            width: 2,
            height: 2,
        };
        let pixels = result.render();
        assert_eq!(&pixels[0..3], &[255, 0, 0]);
        assert_eq!(&pixels[3..6], &[0, 0, 255]);
        assert_eq!(&pixels[9..12], &[255, 0, 0]);
    }
}
