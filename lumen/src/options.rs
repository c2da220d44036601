// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! Rendering options and statistics.

use crate::math::FreeCoordinate;

/// Which optional rendering features are enabled. Semantically a bitfield;
/// preset combinations come from [`Quality::from_level`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Quality {
    pub shadows: bool,
    pub area_lights: bool,
    pub reflect: bool,
    pub refract: bool,
    /// Participating media and other volumetric effects.
    pub volume: bool,
    /// Normal perturbation (bump maps).
    pub normals: bool,
    /// Quick-color mode: only the top texture layer, fully ambient.
    pub full_ambient: bool,
    /// Honored as a flag; the light-buffer accelerator itself is external.
    pub use_light_buffer: bool,
    /// Honored as a flag; the vista-buffer accelerator itself is external.
    pub use_vista_buffer: bool,
}

impl Quality {
    /// Quality presets 0–9, mirroring the traditional meaning of each level:
    /// 0–1 quick colors, 2–3 diffuse without shadows, 4 shadows, 5 extended
    /// (area) lights, 6–7 perturbed normals, 8–9 reflection, refraction and
    /// volume effects.
    pub fn from_level(level: u8) -> Quality {
        let level = level.min(9);
        Quality {
            full_ambient: level <= 1,
            shadows: level >= 4,
            area_lights: level >= 5,
            normals: level >= 6,
            reflect: level >= 8,
            refract: level >= 8,
            volume: level >= 9,
            use_light_buffer: level >= 5,
            use_vista_buffer: level >= 5,
        }
    }
}

impl Default for Quality {
    /// The traditional default: everything on (level 9).
    fn default() -> Self {
        Quality::from_level(9)
    }
}

/// Tunables for the irradiance cache.
#[derive(Clone, Debug, PartialEq)]
pub struct RadiosityOptions {
    pub enabled: bool,
    /// Hemisphere rays per gather at bounce depth 1.
    pub count: usize,
    /// Maximum acceptable combined translation+rotation error for reusing a
    /// cached sample.
    pub error_bound: FreeCoordinate,
    /// 0 = fully colored interreflection, 1 = gray only.
    pub gray: f32,
    /// Output scale applied to depth-1 ambient values; recalibrated by the
    /// preview pass.
    pub brightness: FreeCoordinate,
    /// Upper bound on distances considered during gathering; 0 derives a
    /// default from the camera at setup time.
    pub distance_maximum: FreeCoordinate,
    /// Error-bound multiplier used during preview passes.
    pub low_error_factor: FreeCoordinate,
    /// Minimum reuse radius as a fraction of distance to the camera.
    pub minimum_reuse: FreeCoordinate,
    /// How many nearest accepted samples are averaged.
    pub nearest_count: usize,
    /// Maximum bounce depth that may gather (1 = only primary).
    pub recursion_limit: u32,
}

impl Default for RadiosityOptions {
    fn default() -> Self {
        RadiosityOptions {
            enabled: false,
            count: 35,
            error_bound: 0.4,
            gray: 0.5,
            brightness: 3.3,
            distance_maximum: 0.0,
            low_error_factor: 0.8,
            minimum_reuse: 0.015,
            nearest_count: 4,
            recursion_limit: 1,
        }
    }
}

/// Anti-aliasing settings.
#[derive(Clone, Debug, PartialEq)]
pub struct AntialiasOptions {
    /// Color distance between neighbors above which a pixel is supersampled.
    pub threshold: f32,
    /// Subdivision depth: the non-adaptive grid is `2^depth` per side, the
    /// adaptive sampler recurses this many levels.
    pub depth: u32,
    /// Jitter sample positions.
    pub jitter: bool,
    pub jitter_scale: FreeCoordinate,
    /// Use the adaptive corner-subdivision sampler instead of the fixed
    /// grid.
    pub adaptive: bool,
}

impl Default for AntialiasOptions {
    fn default() -> Self {
        AntialiasOptions {
            threshold: 0.3,
            depth: 3,
            jitter: true,
            jitter_scale: 1.0,
            adaptive: false,
        }
    }
}

/// Interlaced field-rendering settings for animations.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FieldRender {
    /// Render the odd field (else the even field).
    pub odd_field: bool,
    /// Frame number; alternating frames swap fields.
    pub frame_number: u32,
}

/// All rendering options.
#[derive(Clone, Debug)]
pub struct RenderOptions {
    pub quality: Quality,
    /// Maximum ray recursion depth.
    pub max_trace_level: u32,
    /// Rays whose accumulated weight falls below this contribute nothing
    /// visible and are pruned (Adaptive Depth Control).
    pub adc_bailout: FreeCoordinate,
    pub antialias: Option<AntialiasOptions>,
    pub field_render: Option<FieldRender>,
    /// When set, output colors are raised to this power just before delivery.
    pub gamma_factor: Option<f32>,
    pub radiosity: RadiosityOptions,
    /// Seed for all stochastic sampling (jitter, area lights, focal blur).
    pub jitter_seed: u64,
    /// How many pixels between cancellation checks.
    pub abort_test_every: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            quality: Quality::default(),
            max_trace_level: 5,
            adc_bailout: 1.0 / 255.0,
            antialias: None,
            field_render: None,
            gamma_factor: None,
            radiosity: RadiosityOptions::default(),
            jitter_seed: 0x5DEECE66D,
            abort_test_every: 128,
        }
    }
}

/// Counters accumulated over a frame, for diagnostics.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RenderStats {
    pub pixels: u64,
    pub samples: u64,
    pub rays: u64,
    pub shadow_ray_tests: u64,
    pub shadow_rays_succeeded: u64,
    pub shadow_cache_hits: u64,
    pub reflected_rays: u64,
    pub refracted_rays: u64,
    pub transmitted_rays: u64,
    pub internal_reflected_rays: u64,
    /// Rays pruned by the ADC weight test.
    pub adc_saves: u64,
    pub gather_count: u64,
    pub reuse_count: u64,
    pub supersample_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_presets_are_monotonic() {
        let mut previous_feature_count = 0;
        for level in 0..=9 {
            let q = Quality::from_level(level);
            let feature_count = [
                q.shadows,
                q.area_lights,
                q.reflect,
                q.refract,
                q.volume,
                q.normals,
            ]
            .iter()
            .filter(|&&b| b)
            .count();
            assert!(feature_count >= previous_feature_count, "level {}", level);
            previous_feature_count = feature_count;
        }
        assert!(Quality::from_level(0).full_ambient);
        assert!(!Quality::from_level(9).full_ambient);
        assert!(Quality::from_level(9).volume);
    }

    #[test]
    fn default_options() {
        let options = RenderOptions::default();
        assert_eq!(options.max_trace_level, 5);
        assert!((options.adc_bailout - 1.0 / 255.0).abs() < 1e-12);
        assert!(!options.radiosity.enabled);
    }
}
