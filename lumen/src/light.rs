// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! Light sources.

use cgmath::{InnerSpace as _, Point3, Vector3};

use crate::math::{FreeCoordinate, Rgb};

/// Variant data for each supported light type.
pub enum LightKind {
    /// Omnidirectional point light.
    Point,
    /// Spotlight. `radius` and `falloff` are cosines of the inner and outer
    /// cone angles; `coeff` is the tightness exponent.
    Spot {
        /// Unit vector from the light toward its target.
        direction: Vector3<FreeCoordinate>,
        radius: FreeCoordinate,
        falloff: FreeCoordinate,
        coeff: FreeCoordinate,
    },
    /// Cylindrical beam. `radius` and `falloff` are perpendicular distances
    /// from the axis.
    Cylinder {
        direction: Vector3<FreeCoordinate>,
        radius: FreeCoordinate,
        falloff: FreeCoordinate,
        coeff: FreeCoordinate,
    },
    /// Rectangular array of sample points spanning `axis1 × axis2`.
    Area {
        axis1: Vector3<FreeCoordinate>,
        axis2: Vector3<FreeCoordinate>,
        size1: usize,
        size2: usize,
        /// Recursion depth below which subdivision is unconditional.
        adaptive_level: u32,
        /// Jitter sample positions within their grid cells.
        jitter: bool,
    },
    /// Fill light: contributes diffuse illumination but is never shadowed.
    Fill,
}

/// A light source.
pub struct Light {
    pub colour: Rgb,
    pub center: Point3<FreeCoordinate>,
    pub kind: LightKind,
    /// Distance at which intensity has fallen to half; 0 disables fading.
    pub fade_distance: FreeCoordinate,
    pub fade_power: FreeCoordinate,
    /// Whether media along shadow rays attenuates this light.
    pub media_attenuation: bool,
    /// Whether this light interacts with participating media at all.
    pub media_interaction: bool,
}

impl Light {
    pub fn point(center: Point3<FreeCoordinate>, colour: Rgb) -> Self {
        Light {
            colour,
            center,
            kind: LightKind::Point,
            fade_distance: 0.0,
            fade_power: 0.0,
            media_attenuation: false,
            media_interaction: true,
        }
    }

    pub fn fill(center: Point3<FreeCoordinate>, colour: Rgb) -> Self {
        Light {
            kind: LightKind::Fill,
            ..Light::point(center, colour)
        }
    }

    /// An area light centered at `center` spanning the two axes.
    pub fn area(
        center: Point3<FreeCoordinate>,
        colour: Rgb,
        axis1: Vector3<FreeCoordinate>,
        axis2: Vector3<FreeCoordinate>,
        size1: usize,
        size2: usize,
        adaptive_level: u32,
    ) -> Self {
        Light {
            kind: LightKind::Area {
                axis1,
                axis2,
                size1: size1.max(1),
                size2: size2.max(1),
                adaptive_level,
                jitter: false,
            },
            ..Light::point(center, colour)
        }
    }

    #[inline]
    pub fn is_fill(&self) -> bool {
        matches!(self.kind, LightKind::Fill)
    }

    #[inline]
    pub fn is_area(&self) -> bool {
        matches!(self.kind, LightKind::Area { .. })
    }

    /// Intensity attenuation along a ray from a surface point toward this
    /// light. `direction` points from the surface *toward* the light and
    /// `distance` is the separation.
    ///
    /// Covers distance fading (`2/(1+(d/fd)^fp)`, so intensity is nominal at
    /// the fade distance) and the spot/cylinder cone falloff. A zero result
    /// means the point is entirely outside the beam.
    pub fn attenuation(
        &self,
        direction: Vector3<FreeCoordinate>,
        distance: FreeCoordinate,
    ) -> FreeCoordinate {
        let mut attenuation = 1.0;

        if self.fade_power > 0.0 && self.fade_distance > 0.0 {
            attenuation = 2.0 / (1.0 + (distance / self.fade_distance).powf(self.fade_power));
        }

        match &self.kind {
            LightKind::Point | LightKind::Area { .. } | LightKind::Fill => {}
            LightKind::Spot {
                direction: axis,
                radius,
                falloff,
                coeff,
            } => {
                // Angle between the beam axis and the light-to-surface
                // direction.
                let cos_angle = -direction.dot(*axis);
                if cos_angle < *falloff {
                    return 0.0;
                }
                attenuation *= cos_angle.powf(*coeff);
                if cos_angle < *radius && *radius > *falloff {
                    attenuation *= cubic_spline((cos_angle - falloff) / (radius - falloff));
                }
            }
            LightKind::Cylinder {
                direction: axis,
                radius,
                falloff,
                coeff,
            } => {
                // Perpendicular distance of the surface point from the beam
                // axis; the point must be on the lit side.
                let to_surface = -direction * distance;
                let along = to_surface.dot(*axis);
                if along <= 0.0 {
                    return 0.0;
                }
                let dist = (to_surface - axis * along).magnitude();
                if dist >= *falloff {
                    return 0.0;
                }
                if dist > *radius && *falloff > *radius {
                    attenuation *= cubic_spline((falloff - dist) / (falloff - radius));
                }
                attenuation *= (1.0 - dist / falloff).powf(*coeff);
            }
        }

        attenuation
    }
}

/// Hermite smoothstep used for cone edges.
#[inline]
fn cubic_spline(x: FreeCoordinate) -> FreeCoordinate {
    let x = x.clamp(0.0, 1.0);
    x * x * (3.0 - 2.0 * x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_light_fade() {
        let mut light = Light::point(Point3::new(0.0, 0.0, 0.0), Rgb::ONE);
        let up = Vector3::new(0.0, 1.0, 0.0);
        // No fading configured.
        assert_eq!(light.attenuation(up, 100.0), 1.0);

        light.fade_distance = 10.0;
        light.fade_power = 2.0;
        // Nominal intensity exactly at the fade distance, brighter inside,
        // dimmer outside.
        assert!((light.attenuation(up, 10.0) - 1.0).abs() < 1e-12);
        assert!(light.attenuation(up, 1.0) > 1.0);
        assert!(light.attenuation(up, 100.0) < 0.05);
    }

    #[test]
    fn spot_cone() {
        let light = Light {
            kind: LightKind::Spot {
                direction: Vector3::new(0.0, -1.0, 0.0),
                radius: (10f64).to_radians().cos(),
                falloff: (30f64).to_radians().cos(),
                coeff: 0.0,
            },
            ..Light::point(Point3::new(0.0, 10.0, 0.0), Rgb::ONE)
        };
        // Dead center: full intensity.
        let att = light.attenuation(Vector3::new(0.0, 1.0, 0.0), 10.0);
        assert!((att - 1.0).abs() < 1e-12);
        // Outside the falloff cone: zero.
        let sideways = Vector3::new(1.0, 1.0, 0.0).normalize();
        assert_eq!(light.attenuation(sideways, 10.0), 0.0);
        // Between radius and falloff: partially attenuated.
        let angle = (20f64).to_radians();
        let between = Vector3::new(angle.sin(), angle.cos(), 0.0);
        let att = light.attenuation(between, 10.0);
        assert!(att > 0.0 && att < 1.0);
    }

    #[test]
    fn fill_lights_ignore_cones() {
        let light = Light::fill(Point3::new(0.0, 5.0, 0.0), Rgb::ONE);
        assert!(light.is_fill());
        assert_eq!(light.attenuation(Vector3::new(1.0, 0.0, 0.0), 5.0), 1.0);
    }
}
