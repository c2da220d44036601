// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! Surface descriptions: layered textures, pigments, and finishes.
//!
//! A [`Texture`] is a small tree whose leaves are lists of [`Layer`]s; the
//! shading evaluator walks the tree, blending leaf results, then composites
//! the layer list front to back. Pattern and image evaluation proper are
//! pluggable — the core only asks a pattern for a scalar and a pigment for an
//! optional color.

use cgmath::Point3;

use crate::math::{FreeCoordinate, PigmentColour, Rgb};

/// The non-color surface properties of one texture layer.
#[derive(Clone, Debug, PartialEq)]
pub struct Finish {
    /// Ambient light coefficient per channel.
    pub ambient: Rgb,
    pub diffuse: f32,
    /// Exponent applied to `N·L` in the diffuse term.
    pub brilliance: f32,
    /// Random noise subtracted from diffuse intensity (crand graininess).
    pub crand: f32,
    pub phong: f32,
    pub phong_size: f32,
    pub specular: f32,
    /// Specular exponent is `1/roughness`.
    pub roughness: f32,
    /// 0 = plastic highlights, 1 = highlights take the surface color.
    pub metallic: f32,
    /// Per-channel mirror reflection coefficient.
    pub reflection: Rgb,
    /// Exponent applied per channel to reflected color (identity at 1).
    pub reflect_exponent: f32,
    /// Iridescence (thin-film interference) amount.
    pub irid: f32,
    pub irid_film_thickness: f32,
    /// When nonzero, film thickness is modulated by turbulence of this
    /// magnitude.
    pub irid_turbulence: f32,
}

impl Default for Finish {
    fn default() -> Self {
        Finish {
            ambient: Rgb::new(0.1, 0.1, 0.1),
            diffuse: 0.6,
            brilliance: 1.0,
            crand: 0.0,
            phong: 0.0,
            phong_size: 40.0,
            specular: 0.0,
            roughness: 0.05,
            metallic: 0.0,
            reflection: Rgb::ZERO,
            reflect_exponent: 1.0,
            irid: 0.0,
            irid_film_thickness: 0.0,
            irid_turbulence: 0.0,
        }
    }
}

/// Hook for externally-evaluated pigments (image maps, procedural patterns).
/// Returning `None` means the pigment produced no color at this point, e.g. a
/// non-repeating image map missed; the shading core treats that case
/// specially.
pub trait PigmentFn {
    fn compute(&self, point: Point3<FreeCoordinate>) -> Option<PigmentColour>;
}

/// The color-producing part of a texture layer.
pub enum Pigment {
    /// Uniform color.
    Solid(PigmentColour),
    /// Unit-cube checkerboard of two colors. Provided so scenes and tests can
    /// exercise spatially-varying pigments without an external evaluator.
    Checker(PigmentColour, PigmentColour),
    /// Externally evaluated pigment.
    Function(Box<dyn PigmentFn>),
}

impl Pigment {
    /// Evaluates the pigment. `None` signals "no color here" (image map
    /// miss); solid and checker pigments always produce a color.
    pub fn compute(&self, point: Point3<FreeCoordinate>) -> Option<PigmentColour> {
        match self {
            Pigment::Solid(c) => Some(*c),
            Pigment::Checker(a, b) => {
                let parity = (point.x.floor() + point.y.floor() + point.z.floor()) as i64 & 1;
                Some(if parity == 0 { *a } else { *b })
            }
            Pigment::Function(f) => f.compute(point),
        }
    }
}

/// Hook for externally-evaluated surface normal perturbation (bump maps).
pub trait NormalPerturber {
    fn perturb(
        &self,
        normal: cgmath::Vector3<FreeCoordinate>,
        point: Point3<FreeCoordinate>,
    ) -> cgmath::Vector3<FreeCoordinate>;
}

/// One layer of a plain texture.
pub struct Layer {
    pub pigment: Pigment,
    pub finish: Finish,
    pub normal: Option<Box<dyn NormalPerturber>>,
}

impl Layer {
    pub fn new(pigment: Pigment, finish: Finish) -> Self {
        Layer {
            pigment,
            finish,
            normal: None,
        }
    }
}

/// Hook for externally-evaluated scalar patterns driving blend maps.
pub trait Pattern {
    /// Produces the pattern value at a point, nominally in `[0, 1)`.
    fn evaluate(&self, point: Point3<FreeCoordinate>) -> f32;
}

/// Pattern measuring the fractional part of the x coordinate; enough to
/// exercise blend maps in tests and demo scenes.
#[derive(Clone, Copy, Debug)]
pub struct GradientX;

impl Pattern for GradientX {
    fn evaluate(&self, point: Point3<FreeCoordinate>) -> f32 {
        point.x.rem_euclid(1.0) as f32
    }
}

/// Hook mapping a point to an index into a material-map's texture list
/// (externally this is a bitmap lookup).
pub trait MaterialIndex {
    fn index_at(&self, point: Point3<FreeCoordinate>) -> usize;
}

/// A surface texture.
///
/// Layer lists are ordered front to back: the first layer is outermost and
/// filters the ones beneath it.
pub enum Texture {
    /// A list of layers composited front to back.
    Plain(Vec<Layer>),
    /// Weighted average of sub-textures.
    Average(Vec<(f32, Texture)>),
    /// Bitmap material map: an index function selecting among whole textures.
    Material {
        index: Box<dyn MaterialIndex>,
        textures: Vec<Texture>,
    },
    /// Pattern-indexed blend between map entries; adjacent entries
    /// interpolate linearly.
    Blend {
        pattern: Box<dyn Pattern>,
        /// Entries sorted by ascending pattern value.
        map: Vec<(f32, Texture)>,
    },
}

impl Texture {
    /// A one-layer plain texture.
    pub fn solid(pigment: Pigment, finish: Finish) -> Self {
        Texture::Plain(vec![Layer::new(pigment, finish)])
    }

    /// A one-layer plain texture with a uniform color.
    pub fn uniform(colour: PigmentColour, finish: Finish) -> Self {
        Texture::solid(Pigment::Solid(colour), finish)
    }

    /// Finds the blend-map entries bracketing `value`, in the form
    /// `(previous, current, fraction toward current)`.
    ///
    /// Values below the first entry clamp to it, and likewise above the last.
    pub(crate) fn search_blend_map(
        map: &[(f32, Texture)],
        value: f32,
    ) -> (&Texture, &Texture, f32) {
        assert!(!map.is_empty(), "blend map must have at least one entry");
        let mut prev = &map[0];
        for cur in map {
            if value < cur.0 {
                let span = cur.0 - prev.0;
                let fraction = if span > 0.0 { (value - prev.0) / span } else { 0.0 };
                return (&prev.1, &cur.1, fraction);
            }
            prev = cur;
        }
        (&prev.1, &prev.1, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::PigmentColour;

    #[test]
    fn checker_parity() {
        let a = PigmentColour::new(1.0, 1.0, 1.0, 0.0, 0.0);
        let b = PigmentColour::new(0.0, 0.0, 0.0, 0.0, 0.0);
        let pigment = Pigment::Checker(a, b);
        assert_eq!(pigment.compute(Point3::new(0.5, 0.5, 0.5)), Some(a));
        assert_eq!(pigment.compute(Point3::new(1.5, 0.5, 0.5)), Some(b));
        assert_eq!(pigment.compute(Point3::new(1.5, 1.5, 0.5)), Some(a));
        // Negative coordinates continue the same lattice.
        assert_eq!(pigment.compute(Point3::new(-0.5, 0.5, 0.5)), Some(b));
    }

    #[test]
    fn blend_map_search() {
        let map = vec![
            (0.0, Texture::uniform(PigmentColour::WHITE, Finish::default())),
            (1.0, Texture::uniform(PigmentColour::WHITE, Finish::default())),
        ];
        let (_, _, f) = Texture::search_blend_map(&map, 0.25);
        assert!((f - 0.25).abs() < 1e-6);
        // Clamped past the end.
        let (_, _, f) = Texture::search_blend_map(&map, 1.5);
        assert_eq!(f, 0.0);
    }

    #[test]
    fn finish_defaults() {
        let finish = Finish::default();
        assert_eq!(finish.brilliance, 1.0);
        assert_eq!(finish.reflect_exponent, 1.0);
        assert!(finish.roughness > 0.0);
    }
}
