// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! The recursive ray-tracing driver and the per-frame state it carries.
//!
//! [`Tracer`] bundles everything that mutates while a frame renders —
//! counters, the irradiance cache, per-light shadow caches, and the working
//! buffers the shading evaluator saves and restores around recursion. The
//! scene itself is borrowed read-only. Keeping all of it in one explicit
//! struct (rather than statics) is what makes the recursion re-entrant.

use rand::SeedableRng as _;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::io::Write;

use crate::math::{FreeCoordinate, Rgb, Rgba};
use crate::octree::CacheFileError;
use crate::options::{RenderOptions, RenderStats};
use crate::radiosity::RadiosityCache;
use crate::ray::{Ray, TooManyInteriors};
use crate::scene::{ObjectId, Scene, MAX_DISTANCE};

/// Errors that abort a frame.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The cancellation token was triggered.
    #[error("rendering aborted by request")]
    Aborted,
    #[error(transparent)]
    NestedInteriors(#[from] TooManyInteriors),
    #[error(transparent)]
    CacheFile(#[from] CacheFileError),
}

/// Everything that changes while one frame renders.
pub struct Tracer<'a> {
    pub scene: &'a Scene,
    /// Mutable copy of the options: several algorithms temporarily adjust
    /// tunables (the radiosity error bound, quality flags) around recursion.
    pub options: RenderOptions,
    pub stats: RenderStats,
    pub radiosity: RadiosityCache,

    pub(crate) trace_level: u32,
    pub(crate) radiosity_trace_level: u32,
    highest_trace_level: u32,

    /// Per-light memo of shadow-tested color at the current shading point.
    pub(crate) light_tested: Vec<Option<Rgb>>,
    /// Working buffer of (texture index, weight) for the current object.
    pub(crate) texture_weights: Vec<(usize, FreeCoordinate)>,
    /// Per-light cached opaque blocker from the last successful shadow test.
    pub(crate) shadow_caches: Vec<Option<ObjectId>>,
    /// Per-light area-light sample grids; `None` entries are uncomputed.
    pub(crate) area_grids: Vec<Vec<Option<Rgb>>>,
    pub(crate) rng: Xoshiro256PlusPlus,
    /// Optional sink receiving each new depth-1 irradiance block as it is
    /// gathered, so an interrupted render can be resumed.
    pub(crate) cache_append: Option<Box<dyn Write + 'a>>,
    /// A structural error detected deep inside shading (interior-stack
    /// overflow). Checked at the next pixel boundary, where it aborts the
    /// frame.
    pub(crate) fatal: Option<RenderError>,
}

impl<'a> Tracer<'a> {
    pub fn new(scene: &'a Scene, options: &RenderOptions) -> Self {
        let mut options = options.clone();
        if options.radiosity.enabled && options.radiosity.distance_maximum == 0.0 {
            // No configured maximum distance; derive one from the camera.
            options.radiosity.distance_maximum = scene.camera.focus_distance() * 0.2;
        }

        let area_grids = scene
            .lights
            .iter()
            .map(|light| match &light.kind {
                crate::light::LightKind::Area { size1, size2, .. } => {
                    vec![None; size1 * size2]
                }
                _ => Vec::new(),
            })
            .collect();

        Tracer {
            scene,
            stats: RenderStats::default(),
            radiosity: RadiosityCache::new(&options.radiosity),
            trace_level: 0,
            radiosity_trace_level: 1,
            highest_trace_level: 0,
            light_tested: vec![None; scene.lights.len()],
            texture_weights: Vec::with_capacity(4),
            shadow_caches: vec![None; scene.lights.len()],
            area_grids,
            rng: Xoshiro256PlusPlus::seed_from_u64(options.jitter_seed),
            cache_append: None,
            fatal: None,
            options,
        }
    }

    /// Pushes `id` onto an interior stack, recording the structural error
    /// for the next safe point if the nesting limit is exceeded.
    pub(crate) fn enter_interior(
        &mut self,
        interiors: &mut crate::ray::InteriorStack,
        id: ObjectId,
    ) {
        if let Err(error) = interiors.enter(id) {
            if self.fatal.is_none() {
                self.fatal = Some(RenderError::from(error));
            }
        }
    }

    /// Takes any structural error recorded since the last check.
    pub fn take_fatal(&mut self) -> Option<RenderError> {
        self.fatal.take()
    }

    /// Registers a sink that receives each depth-1 irradiance block as soon
    /// as it is gathered.
    pub fn set_cache_append(&mut self, sink: Box<dyn Write + 'a>) {
        self.cache_append = Some(sink);
    }

    /// Deepest recursion level reached so far this frame.
    pub fn highest_trace_level(&self) -> u32 {
        self.highest_trace_level
    }

    /// Traces a primary ray (recursion level 1).
    pub fn trace_primary(&mut self, ray: &Ray, weight: FreeCoordinate) -> (Rgba, FreeCoordinate) {
        self.trace_level = 1;
        self.stats.samples += 1;
        self.trace(ray, weight)
    }

    /// Traces `ray`, returning the radiance arriving along it and the depth
    /// of the nearest intersection ([`MAX_DISTANCE`] on a miss).
    ///
    /// `weight` is the ADC factor: the product of attenuations between the
    /// camera and this ray. Rays past the recursion limit or too weak to
    /// matter return black immediately.
    pub fn trace(&mut self, ray: &Ray, weight: FreeCoordinate) -> (Rgba, FreeCoordinate) {
        self.stats.rays += 1;

        // Transmittance starts at 1 so alpha-channel output works.
        let mut colour = Rgba::CLEAR;

        if self.trace_level > self.options.max_trace_level || weight < self.options.adc_bailout {
            if weight < self.options.adc_bailout {
                self.stats.adc_saves += 1;
            }
            return (colour, MAX_DISTANCE);
        }

        if self.trace_level > self.highest_trace_level {
            self.highest_trace_level = self.trace_level;
        }

        let best = self.scene.intersect_best(ray, MAX_DISTANCE, None, false);

        let depth = match best {
            Some(intersection) => {
                colour = self.determine_apparent_colour(&intersection, ray, weight);
                intersection.t
            }
            None => {
                // Infinite ray; apply sky and other unbounded effects.
                if let Some(atmosphere) = &self.scene.atmosphere {
                    atmosphere.infinite(ray, &mut colour);
                }
                MAX_DISTANCE
            }
        };

        // Finite atmospheric effects apply as long as the ray is not inside
        // any solid object.
        if self.options.quality.volume && self.ray_all_hollow(ray) {
            if let Some(atmosphere) = &self.scene.atmosphere {
                atmosphere.finite(ray, depth, &mut colour, false);
            }
        }

        (colour, depth)
    }

    /// Traces a secondary ray one recursion level down.
    pub(crate) fn trace_nested(
        &mut self,
        ray: &Ray,
        weight: FreeCoordinate,
    ) -> (Rgba, FreeCoordinate) {
        self.trace_level += 1;
        let result = self.trace(ray, weight);
        self.trace_level -= 1;
        result
    }

    /// True when none of the interiors the ray is inside is solid.
    /// (Vacuously true in the open atmosphere.)
    pub(crate) fn ray_all_hollow(&self, ray: &Ray) -> bool {
        ray.interiors.iter().all(|id| {
            self.scene
                .object(id)
                .interior
                .as_ref()
                .map_or(true, |interior| interior.hollow)
        })
    }

    /// Applies the participating media of every hollow interior the ray is
    /// currently inside, provided no solid interior encloses it.
    pub(crate) fn simulate_media(
        &self,
        ray: &Ray,
        depth: FreeCoordinate,
        colour: &mut Rgba,
        in_shadow: bool,
    ) {
        if ray.interiors.is_empty() || !self.ray_all_hollow(ray) {
            return;
        }
        for id in ray.interiors.iter() {
            if let Some(interior) = &self.scene.object(id).interior {
                if interior.hollow {
                    if let Some(media) = &interior.media {
                        media.simulate(ray, depth, colour, in_shadow);
                    }
                }
            }
        }
    }
}
