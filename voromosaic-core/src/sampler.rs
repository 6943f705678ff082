//! Brightness-weighted site selection.
//!
//! Rejection-samples pixels with acceptance proportional to brightness
//! (red channel + 1, or its inverse), then suppresses the neighborhood of
//! each accepted pixel so sites come out spatially separated without any
//! Poisson-disk machinery.

use image::RgbaImage;
use tracing::debug;

use crate::rng::Mulberry32;
use crate::site::Position;
use crate::{Result, VoronoiError};

/// Samples `count` distinct sites from an image.
#[derive(Debug, Clone)]
pub struct SiteSampler {
    count: usize,
    inverse_bias: bool,
    seed: u32,
}

impl SiteSampler {
    /// `inverse_bias = false` favors bright pixels, `true` favors dark ones.
    pub fn new(count: usize, inverse_bias: bool, seed: u32) -> Self {
        Self {
            count,
            inverse_bias,
            seed,
        }
    }

    /// Produce the ordered list of accepted sites.
    ///
    /// Deterministic: the same `(image, count, inverse_bias, seed)` always
    /// yields the identical list.
    pub fn sample(&self, image: &RgbaImage) -> Result<Vec<Position>> {
        let width = image.width() as usize;
        let height = image.height() as usize;
        let num_pixels = width * height;

        if self.count == 0 {
            return Err(VoronoiError::InvalidConfig(
                "site count must be at least 1".into(),
            ));
        }
        if num_pixels == 0 {
            return Err(VoronoiError::InvalidConfig("empty image".into()));
        }
        if self.count > num_pixels {
            return Err(VoronoiError::InvalidConfig(format!(
                "cannot place {} sites on a {}x{} image",
                self.count, width, height
            )));
        }

        // Per-pixel weight in [1, 256]: brightness is red + 1.
        let raw = image.as_raw();
        let mut weights: Vec<u16> = (0..num_pixels)
            .map(|i| {
                let brightness = raw[i * 4] as u16 + 1;
                if self.inverse_bias {
                    257 - brightness
                } else {
                    brightness
                }
            })
            .collect();
        let mut taken = vec![false; num_pixels];

        let mut rng = Mulberry32::new(self.seed);
        let mut sites = Vec::with_capacity(self.count);
        let mut draws = 0u64;

        while sites.len() < self.count {
            draws += 1;
            let idx = rng.next_index(num_pixels);
            let u = rng.next_f64() * 256.0;
            if u > weights[idx] as f64 || taken[idx] {
                continue;
            }

            let x = idx % width;
            let y = idx / width;
            sites.push(Position::new(x as f64, y as f64));
            taken[idx] = true;

            // Suppress the neighborhood: zero the site, halve a square of
            // side 2r+1 around it, radius growing with the local weight.
            let w_before = weights[idx];
            weights[idx] = 0;
            let r = if w_before == 0 {
                1
            } else {
                (w_before.ilog2() as usize + 1).max(1)
            };
            let x0 = x.saturating_sub(r);
            let y0 = y.saturating_sub(r);
            let x1 = (x + r).min(width - 1);
            let y1 = (y + r).min(height - 1);
            for ny in y0..=y1 {
                let row = ny * width;
                for nx in x0..=x1 {
                    weights[row + nx] /= 2;
                }
            }
        }

        debug!(
            sites = sites.len(),
            draws,
            inverse_bias = self.inverse_bias,
            "site sampling complete"
        );
        Ok(sites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_image(width: u32, height: u32, rgb: [u8; 3]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, image::Rgba([rgb[0], rgb[1], rgb[2], 255]))
    }

    /// Left half black, right half white.
    fn split_image(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                image::Rgba([0, 0, 0, 255])
            } else {
                image::Rgba([255, 255, 255, 255])
            }
        })
    }

    #[test]
    fn deterministic_for_same_seed() {
        let image = split_image(32, 32);
        let a = SiteSampler::new(20, false, 99).sample(&image).unwrap();
        let b = SiteSampler::new(20, false, 99).sample(&image).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sites_distinct_and_in_bounds() {
        let image = flat_image(16, 16, [128, 128, 128]);
        let sites = SiteSampler::new(50, false, 1).sample(&image).unwrap();
        assert_eq!(sites.len(), 50);

        let mut seen = std::collections::HashSet::new();
        for site in &sites {
            assert!(site.x >= 0.0 && site.x < 16.0);
            assert!(site.y >= 0.0 && site.y < 16.0);
            assert!(seen.insert((site.x as u32, site.y as u32)), "duplicate site");
        }
    }

    #[test]
    fn bias_follows_brightness() {
        let image = split_image(64, 64);
        let bright = SiteSampler::new(40, false, 5).sample(&image).unwrap();
        let dark = SiteSampler::new(40, true, 5).sample(&image).unwrap();

        let mean_x = |sites: &[Position]| {
            sites.iter().map(|p| p.x).sum::<f64>() / sites.len() as f64
        };
        assert!(
            mean_x(&bright) > mean_x(&dark),
            "brightness bias should pull sites toward the white half"
        );
    }

    #[test]
    fn rejects_more_sites_than_pixels() {
        let image = flat_image(4, 4, [255, 255, 255]);
        assert!(matches!(
            SiteSampler::new(17, false, 0).sample(&image),
            Err(VoronoiError::InvalidConfig(_))
        ));
        assert!(SiteSampler::new(16, false, 0).sample(&image).is_ok());
    }

    #[test]
    fn rejects_zero_count() {
        let image = flat_image(4, 4, [255, 255, 255]);
        assert!(matches!(
            SiteSampler::new(0, false, 0).sample(&image),
            Err(VoronoiError::InvalidConfig(_))
        ));
    }

    #[test]
    fn fills_every_pixel_when_count_equals_area() {
        let image = flat_image(5, 5, [200, 0, 0]);
        let sites = SiteSampler::new(25, false, 77).sample(&image).unwrap();
        let mut seen: Vec<_> = sites
            .iter()
            .map(|p| (p.x as u32, p.y as u32))
            .collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 25);
    }
}
