// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! Focal blur: aperture sampling with statistical early exit.
//!
//! Sample positions on the aperture come from a fixed "best" pattern — the
//! corners of a 2×2 grid, or a 7/19/37-point hexagonal rosette when enough
//! samples are requested — topped up from a uniform grid with unique random
//! placement. After each batch of rays, the per-channel sample variance is
//! compared against thresholds derived from χ² quantiles at the configured
//! confidence; a pixel whose variance is already credible stops early.

use cgmath::{InnerSpace as _, Vector3};
use rand::Rng;

use crate::camera::Camera;
use crate::math::FreeCoordinate;

/// Side length of the sub-pixel grid each blur ray picks a cell from.
pub const SUB_PIXEL_GRID_SIZE: usize = 3;

/// 2×2 grid, the minimal pattern.
static GRID1: [(FreeCoordinate, FreeCoordinate); 4] = [
    (-0.25, 0.25),
    (0.25, 0.25),
    (-0.25, -0.25),
    (0.25, -0.25),
];

static HEXJITTER2: FreeCoordinate = 0.144338;
static HEXGRID2_BATCHES: [usize; 2] = [7, 0];
static HEXGRID2: [(FreeCoordinate, FreeCoordinate); 7] = [
    (-0.288675, 0.000000),
    (0.000000, 0.000000),
    (0.288675, 0.000000),
    (-0.144338, 0.250000),
    (-0.144338, -0.250000),
    (0.144338, 0.250000),
    (0.144338, -0.250000),
];

static HEXJITTER3: FreeCoordinate = 0.096225;
static HEXGRID3_BATCHES: [usize; 4] = [7, 6, 6, 0];
static HEXGRID3: [(FreeCoordinate, FreeCoordinate); 19] = [
    (-0.192450, 0.333333),
    (-0.192450, -0.333333),
    (0.192450, 0.333333),
    (0.192450, -0.333333),
    (0.384900, 0.000000),
    (-0.384900, 0.000000),
    (0.000000, 0.000000),
    (0.000000, 0.333333),
    (0.000000, -0.333333),
    (-0.288675, 0.166667),
    (-0.288675, -0.166667),
    (0.288675, 0.166667),
    (0.288675, -0.166667),
    (-0.096225, 0.166667),
    (-0.096225, -0.166667),
    (0.096225, 0.166667),
    (0.096225, -0.166667),
    (-0.192450, 0.000000),
    (0.192450, 0.000000),
];

static HEXJITTER4: FreeCoordinate = 0.0721688;
static HEXGRID4_BATCHES: [usize; 9] = [7, 6, 6, 4, 4, 4, 4, 2, 0];
static HEXGRID4: [(FreeCoordinate, FreeCoordinate); 37] = [
    (0.000000, 0.000000),
    (-0.216506, 0.375000),
    (0.216506, -0.375000),
    (-0.216506, -0.375000),
    (0.216506, 0.375000),
    (-0.433013, 0.000000),
    (0.433013, 0.000000),
    (-0.144338, 0.250000),
    (0.144338, -0.250000),
    (-0.144338, -0.250000),
    (0.144338, 0.250000),
    (-0.288675, 0.000000),
    (0.288675, 0.000000),
    (-0.072169, 0.125000),
    (0.072169, -0.125000),
    (-0.072169, -0.125000),
    (0.072169, 0.125000),
    (-0.144338, 0.000000),
    (0.144338, 0.000000),
    (-0.360844, 0.125000),
    (-0.360844, -0.125000),
    (0.360844, 0.125000),
    (0.360844, -0.125000),
    (-0.288675, 0.250000),
    (-0.288675, -0.250000),
    (0.288675, 0.250000),
    (0.288675, -0.250000),
    (-0.072169, 0.375000),
    (-0.072169, -0.375000),
    (0.072169, 0.375000),
    (0.072169, -0.375000),
    (-0.216506, 0.125000),
    (-0.216506, -0.125000),
    (0.216506, 0.125000),
    (0.216506, -0.125000),
    (0.000000, 0.250000),
    (0.000000, -0.250000),
];

/// Precomputed per-frame focal-blur state.
pub(crate) struct BlurSampler {
    pub blur_samples: usize,
    aperture: FreeCoordinate,
    max_jitter: FreeCoordinate,
    /// Aperture offsets, one per potential sample.
    sample_grid: Vec<(FreeCoordinate, FreeCoordinate)>,
    /// Batch sizes before each variance test; `None` means quartets.
    batches: Option<&'static [usize]>,
    /// Variance thresholds indexed by samples-taken-so-far − 1.
    thresholds: Vec<FreeCoordinate>,
    /// Film-plane crosshair.
    x_perp: Vector3<FreeCoordinate>,
    y_perp: Vector3<FreeCoordinate>,
    /// Distance to the focal plane in view-direction units.
    pub focal_distance: FreeCoordinate,
}

impl BlurSampler {
    pub fn new(camera: &Camera, rng: &mut impl Rng) -> Self {
        let blur_samples = camera.blur_samples;

        // Thresholds for the confidence test.
        let mut thresholds = vec![0.0; blur_samples.max(1)];
        if blur_samples > 1 {
            let t1 = camera.variance
                / chdtri((blur_samples - 1) as FreeCoordinate, camera.confidence);
            for (i, slot) in thresholds.iter_mut().enumerate() {
                *slot = t1 * chdtri((i + 1) as FreeCoordinate, camera.confidence);
            }
        }

        // Choose the densest standard pattern that fits.
        let (standard, batches, max_jitter): (
            &[(FreeCoordinate, FreeCoordinate)],
            Option<&'static [usize]>,
            FreeCoordinate,
        ) = if blur_samples >= HEXGRID4.len() {
            (&HEXGRID4, Some(&HEXGRID4_BATCHES), HEXJITTER4)
        } else if blur_samples >= HEXGRID3.len() {
            (&HEXGRID3, Some(&HEXGRID3_BATCHES), HEXJITTER3)
        } else if blur_samples >= HEXGRID2.len() {
            (&HEXGRID2, Some(&HEXGRID2_BATCHES), HEXJITTER2)
        } else {
            (&GRID1, None, 1.0 / (2.0 * (blur_samples.max(1) as FreeCoordinate).sqrt()))
        };
        // A sample count exactly matching a hex pattern keeps that
        // pattern's jitter radius; anything else falls back to the uniform
        // default.
        let max_jitter = match blur_samples {
            n if n == HEXGRID2.len() => HEXJITTER2,
            n if n == HEXGRID3.len() => HEXJITTER3,
            n if n == HEXGRID4.len() => HEXJITTER4,
            n => {
                if standard.len() == GRID1.len() {
                    max_jitter
                } else {
                    1.0 / (2.0 * (n.max(1) as FreeCoordinate).sqrt())
                }
            }
        };

        let mut sample_grid: Vec<(FreeCoordinate, FreeCoordinate)> =
            standard.iter().copied().take(blur_samples).collect();

        // Fill the remainder from a uniform grid, each cell used once.
        if blur_samples > standard.len() {
            let mut grid_size = (blur_samples as FreeCoordinate).sqrt() as usize + 1;
            if grid_size % 2 == 0 {
                grid_size += 1;
            }
            let mut used = vec![false; grid_size * grid_size];

            // Mark sub-cells already covered by the standard pattern.
            for &(x, y) in &sample_grid {
                let xi = ((x + 0.5) * grid_size as FreeCoordinate) as usize;
                let yi = ((y + 0.5) * grid_size as FreeCoordinate) as usize;
                used[yi.min(grid_size - 1) * grid_size + xi.min(grid_size - 1)] = true;
            }

            while sample_grid.len() < blur_samples {
                let xi = rng.gen_range(0..grid_size);
                let yi = rng.gen_range(0..grid_size);
                if !used[yi * grid_size + xi] {
                    used[yi * grid_size + xi] = true;
                    sample_grid.push((
                        (2 * xi + 1) as FreeCoordinate / (2 * grid_size) as FreeCoordinate - 0.5,
                        (2 * yi + 1) as FreeCoordinate / (2 * grid_size) as FreeCoordinate - 0.5,
                    ));
                }
            }
        }

        // The crosshair on the film plane, perpendicular to the view.
        let x_perp = camera.up.cross(camera.direction).normalize();
        let y_perp = camera.direction.cross(x_perp).normalize();
        let focal_distance = camera.focal_distance / camera.direction.magnitude();

        BlurSampler {
            blur_samples,
            aperture: camera.aperture,
            max_jitter,
            sample_grid,
            batches,
            thresholds,
            x_perp,
            y_perp,
            focal_distance,
        }
    }

    /// How many rays to shoot before the variance test at schedule position
    /// `level` (which advances).
    pub fn batch_size(&self, level: &mut usize) -> usize {
        if let Some(batches) = self.batches {
            if *level < batches.len() && batches[*level] > 0 {
                let n = batches[*level];
                *level += 1;
                return n;
            }
        }
        4
    }

    /// The jittered eye-position deflection for sample `ray_number`.
    pub fn deflection(
        &self,
        ray_number: usize,
        rng: &mut impl Rng,
    ) -> Vector3<FreeCoordinate> {
        let r = self.aperture * 0.5;
        let (gx, gy) = self.sample_grid[ray_number];
        let x_jitter = self.max_jitter * (rng.gen::<FreeCoordinate>() * 2.0 - 1.0);
        let y_jitter = self.max_jitter * (rng.gen::<FreeCoordinate>() * 2.0 - 1.0);
        let x_len = r * (gx + x_jitter);
        let y_len = r * (gy + y_jitter);
        self.x_perp * x_len - self.y_perp * y_len
    }

    /// The variance threshold applicable once `samples` rays have been
    /// traced.
    pub fn threshold(&self, samples: usize) -> FreeCoordinate {
        self.thresholds[samples - 1]
    }
}

/// Natural log of the gamma function (Lanczos approximation, g = 7).
fn ln_gamma(x: FreeCoordinate) -> FreeCoordinate {
    const COEFFICIENTS: [FreeCoordinate; 9] = [
        0.99999999999980993,
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];
    if x < 0.5 {
        // Reflection for the left half plane.
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut sum = COEFFICIENTS[0];
    for (i, &c) in COEFFICIENTS.iter().enumerate().skip(1) {
        sum += c / (x + i as FreeCoordinate);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + sum.ln()
}

/// Regularized lower incomplete gamma function P(a, x), by series expansion.
fn igam(a: FreeCoordinate, x: FreeCoordinate) -> FreeCoordinate {
    if x <= 0.0 {
        return 0.0;
    }
    let ax = a * x.ln() - x - ln_gamma(a);
    if ax < -709.0 {
        return 0.0;
    }
    let ax = ax.exp();

    let mut r = a;
    let mut c = 1.0;
    let mut ans = 1.0;
    loop {
        r += 1.0;
        c *= x / r;
        ans += c;
        if c / ans <= 1.0e-15 {
            break;
        }
    }
    ans * ax / a
}

/// Regularized upper incomplete gamma function Q(a, x) = 1 − P(a, x), by
/// continued fraction for large x.
fn igamc(a: FreeCoordinate, x: FreeCoordinate) -> FreeCoordinate {
    if x <= 0.0 {
        return 1.0;
    }
    if x < 1.0 || x < a {
        return 1.0 - igam(a, x);
    }

    let ax = a * x.ln() - x - ln_gamma(a);
    if ax < -709.0 {
        return 0.0;
    }
    let ax = ax.exp();

    // Lentz's continued fraction.
    let tiny = 1.0e-300;
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / tiny;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..300 {
        let an = -(i as FreeCoordinate) * (i as FreeCoordinate - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < tiny {
            d = tiny;
        }
        c = b + an / c;
        if c.abs() < tiny {
            c = tiny;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() <= 1.0e-15 {
            break;
        }
    }
    ax * h
}

/// Inverse of the complemented χ² distribution: the `x` for which a χ²
/// variable with `df` degrees of freedom exceeds `x` with probability `y`.
pub(crate) fn chdtri(df: FreeCoordinate, y: FreeCoordinate) -> FreeCoordinate {
    let y = y.clamp(1.0e-12, 1.0 - 1.0e-12);
    let a = 0.5 * df;

    // igamc(a, x/2) falls monotonically from 1 to 0 in x; bracket and
    // bisect.
    let mut lo = 0.0;
    let mut hi = 1.0;
    while igamc(a, 0.5 * hi) > y {
        hi *= 2.0;
        if hi > 1.0e300 {
            break;
        }
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if igamc(a, 0.5 * mid) > y {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1.0e-12 * hi.max(1.0) {
            break;
        }
    }
    0.5 * (lo + hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Camera, Projection};
    use cgmath::Point3;
    use rand::SeedableRng as _;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn blur_camera(samples: usize) -> Camera {
        let mut camera = Camera::looking_at(
            Projection::Perspective,
            Point3::new(0.0, 0.0, -5.0),
            Point3::new(0.0, 0.0, 0.0),
        );
        camera.aperture = 0.4;
        camera.blur_samples = samples;
        camera
    }

    #[test]
    fn chi_square_quantiles_match_tables() {
        // Standard upper-tail quantiles.
        assert!((chdtri(1.0, 0.05) - 3.8415).abs() < 1e-3);
        assert!((chdtri(2.0, 0.05) - 5.9915).abs() < 1e-3);
        assert!((chdtri(10.0, 0.95) - 3.9403).abs() < 1e-3);
        assert!((chdtri(5.0, 0.5) - 4.3515).abs() < 1e-3);
    }

    #[test]
    fn sample_grid_covers_requested_count() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        for &n in &[4usize, 7, 12, 19, 37, 50] {
            let sampler = BlurSampler::new(&blur_camera(n), &mut rng);
            assert_eq!(sampler.sample_grid.len(), n, "samples = {}", n);
            // All offsets stay within the unit aperture square.
            for &(x, y) in &sampler.sample_grid {
                assert!(x.abs() <= 0.5 && y.abs() <= 0.5);
            }
        }
    }

    #[test]
    fn hex_batch_schedules_selected_by_size() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let sampler = BlurSampler::new(&blur_camera(19), &mut rng);
        let mut level = 0;
        assert_eq!(sampler.batch_size(&mut level), 7);
        assert_eq!(sampler.batch_size(&mut level), 6);
        assert_eq!(sampler.batch_size(&mut level), 6);
        // Schedule exhausted: quartets from here on.
        assert_eq!(sampler.batch_size(&mut level), 4);

        let small = BlurSampler::new(&blur_camera(5), &mut rng);
        let mut level = 0;
        assert_eq!(small.batch_size(&mut level), 4);
    }

    #[test]
    fn thresholds_grow_with_sample_count() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let sampler = BlurSampler::new(&blur_camera(37), &mut rng);
        for i in 2..37 {
            assert!(
                sampler.threshold(i) >= sampler.threshold(i - 1),
                "thresholds must not shrink"
            );
        }
    }

    #[test]
    fn deflection_is_in_the_film_plane() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let camera = blur_camera(7);
        let sampler = BlurSampler::new(&camera, &mut rng);
        for i in 0..7 {
            let d = sampler.deflection(i, &mut rng);
            // Perpendicular to the viewing direction.
            assert!(d.dot(camera.direction).abs() < 1e-9);
            assert!(d.magnitude() <= camera.aperture);
        }
    }
}
