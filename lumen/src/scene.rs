// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! Scene ownership: objects with shapes, textures and interiors, plus the
//! hooks for atmosphere and participating media.
//!
//! The scene exclusively owns objects, lights, and textures; the trace
//! machinery borrows it read-only for the duration of a frame. Anything that
//! must refer to an object across that boundary (light shadow caches, the
//! interior stack) uses a weak [`ObjectId`] resolved through the scene.

use cgmath::{Point3, Vector3};

use crate::camera::Camera;
use crate::light::Light;
use crate::math::{FreeCoordinate, Rgb, Rgba};
use crate::ray::Ray;
use crate::shape::Shape;
use crate::texture::{Pigment, Texture};

/// Index of an [`Object`] within its owning [`Scene`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectId(pub usize);

/// Distance assigned to rays which hit nothing; effectively infinity for
/// scene purposes.
pub const MAX_DISTANCE: FreeCoordinate = 1.0e7;

/// The inside of an object, for refraction and volumetric purposes.
///
/// An object that participates in refraction owns exactly one interior.
pub struct Interior {
    /// Refractive index.
    pub ior: FreeCoordinate,
    /// Distance at which transmitted light has faded to half; 0 disables
    /// fading.
    pub fade_distance: FreeCoordinate,
    pub fade_power: FreeCoordinate,
    /// Faked-caustics strength applied to shadow rays through this interior.
    pub caustics: f32,
    /// Hollow interiors admit participating media and atmospheric effects.
    pub hollow: bool,
    /// Participating medium, if any.
    pub media: Option<Box<dyn Media>>,
}

impl Default for Interior {
    fn default() -> Self {
        Interior {
            ior: 1.0,
            fade_distance: 0.0,
            fade_power: 0.0,
            caustics: 0.0,
            hollow: false,
            media: None,
        }
    }
}

/// Participating-media hook. The core determines *when* media applies (which
/// interiors are hollow, what segment of the ray is affected); the integrator
/// itself is external.
pub trait Media {
    /// Applies this medium's effect to `colour` over the first `depth` units
    /// of `ray`.
    fn simulate(&self, ray: &Ray, depth: FreeCoordinate, colour: &mut Rgba, in_shadow: bool);
}

/// Atmospheric effects hook: sky/background for rays that leave the scene,
/// and fog-like attenuation over finite segments.
pub trait Atmosphere {
    /// Applies infinite effects (sky, background) to a ray that hit nothing.
    fn infinite(&self, ray: &Ray, colour: &mut Rgba);

    /// Applies finite effects (fog) over the first `depth` units of `ray`.
    /// `towards_light` distinguishes light-source rays from viewing rays.
    fn finite(&self, ray: &Ray, depth: FreeCoordinate, colour: &mut Rgba, towards_light: bool);
}

/// Per-object boolean properties consulted during shading and shadowing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ObjectFlags {
    /// The object casts no shadows.
    pub no_shadow: bool,
    /// The object's textures are known fully opaque, so it may be cached as
    /// a definitive shadow blocker.
    pub opaque: bool,
    /// Illuminate the object even when the light is behind the surface.
    pub double_illuminate: bool,
}

/// How an object maps an intersection to entries of its texture list.
pub enum TextureSelect {
    /// One texture for the whole surface (`textures[0]`).
    Uniform,
    /// The intersection cookie indexes the texture list, as for meshes with
    /// per-triangle textures.
    ByCookie,
    /// Externally computed weights over the texture list, as for blobs.
    Weighted(Box<dyn WeightedTextures>),
}

/// Hook producing `(texture index, weight)` pairs at a point, for
/// multi-textured primitives.
pub trait WeightedTextures {
    fn weights_at(&self, point: Point3<FreeCoordinate>, out: &mut Vec<(usize, FreeCoordinate)>);
}

/// A renderable object: geometry plus surface and interior description.
pub struct Object {
    pub shape: Box<dyn Shape>,
    pub textures: Vec<Texture>,
    pub texture_select: TextureSelect,
    pub interior: Option<Interior>,
    pub flags: ObjectFlags,
}

impl Object {
    /// An object with a single texture and a default interior; the opacity
    /// flag is derived from the texture.
    pub fn new(shape: Box<dyn Shape>, texture: Texture) -> Self {
        let opaque = texture_is_opaque(&texture);
        Object {
            shape,
            textures: vec![texture],
            texture_select: TextureSelect::Uniform,
            // Every object owns an interior (refraction through a default
            // one transmits without bending); scenery that should have no
            // inside at all can opt out.
            interior: Some(Interior::default()),
            flags: ObjectFlags {
                opaque,
                ..ObjectFlags::default()
            },
        }
    }

    pub fn with_interior(mut self, interior: Interior) -> Self {
        self.interior = Some(interior);
        self
    }

    pub fn without_interior(mut self) -> Self {
        self.interior = None;
        self
    }
}

/// Conservative opacity analysis: true only when every reachable pigment is
/// definitely free of filter and transmit. Externally evaluated pigments are
/// assumed translucent.
fn texture_is_opaque(texture: &Texture) -> bool {
    match texture {
        Texture::Plain(layers) => layers.iter().all(|layer| match &layer.pigment {
            Pigment::Solid(c) => c.filter == 0.0 && c.transmit == 0.0,
            Pigment::Checker(a, b) => {
                a.filter == 0.0 && a.transmit == 0.0 && b.filter == 0.0 && b.transmit == 0.0
            }
            Pigment::Function(_) => false,
        }),
        Texture::Average(entries) => entries.iter().all(|(_, t)| texture_is_opaque(t)),
        Texture::Material { textures, .. } => textures.iter().all(texture_is_opaque),
        Texture::Blend { map, .. } => map.iter().all(|(_, t)| texture_is_opaque(t)),
    }
}

/// A ray/scene intersection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Intersection {
    pub object: ObjectId,
    /// Parametric depth along the ray.
    pub t: FreeCoordinate,
    pub point: Point3<FreeCoordinate>,
    /// Opaque per-object value for the normal evaluator.
    pub cookie: usize,
}

/// A complete scene.
pub struct Scene {
    pub objects: Vec<Object>,
    pub lights: Vec<Light>,
    /// Global ambient light multiplier.
    pub ambient_light: Rgb,
    /// Refractive index of empty space between objects.
    pub atmosphere_ior: FreeCoordinate,
    /// Dominant wavelengths used by iridescence, nominally (red, green, blue).
    pub irid_wavelengths: Rgb,
    pub atmosphere: Option<Box<dyn Atmosphere>>,
    pub camera: Camera,
}

impl Scene {
    pub fn new(camera: Camera) -> Self {
        Scene {
            objects: Vec::new(),
            lights: Vec::new(),
            ambient_light: Rgb::ONE,
            atmosphere_ior: 1.0,
            irid_wavelengths: Rgb::new(0.25, 0.18, 0.14),
            atmosphere: None,
            camera,
        }
    }

    #[inline]
    pub fn object(&self, id: ObjectId) -> &Object {
        &self.objects[id.0]
    }

    /// Adds an object, returning its id.
    pub fn push_object(&mut self, object: Object) -> ObjectId {
        self.objects.push(object);
        ObjectId(self.objects.len() - 1)
    }

    /// Closest intersection along `ray` nearer than `max_depth`, by linear
    /// sweep over all objects. `skip` omits one object (used by the shadow
    /// walk to avoid re-testing the cached blocker), and `shadow_test`
    /// additionally skips objects flagged as casting no shadow.
    pub fn intersect_best(
        &self,
        ray: &Ray,
        max_depth: FreeCoordinate,
        skip: Option<ObjectId>,
        shadow_test: bool,
    ) -> Option<Intersection> {
        let mut best: Option<Intersection> = None;
        let mut best_t = max_depth;
        for (index, object) in self.objects.iter().enumerate() {
            let id = ObjectId(index);
            if Some(id) == skip || (shadow_test && object.flags.no_shadow) {
                continue;
            }
            if let Some(hit) = object.shape.intersect(ray) {
                if hit.t < best_t {
                    best_t = hit.t;
                    best = Some(Intersection {
                        object: id,
                        t: hit.t,
                        point: ray.at(hit.t),
                        cookie: hit.cookie,
                    });
                }
            }
        }
        best
    }

    /// Ids of all objects with interiors containing `point`, in scene order.
    /// Used to populate a primary ray's interior stack.
    pub fn containing_interiors<'a>(
        &'a self,
        point: Point3<FreeCoordinate>,
    ) -> impl Iterator<Item = ObjectId> + 'a {
        self.objects
            .iter()
            .enumerate()
            .filter(move |(_, object)| object.interior.is_some() && object.shape.inside(point))
            .map(|(index, _)| ObjectId(index))
    }

    /// The geometric normal at an intersection.
    #[inline]
    pub fn normal_at(&self, intersection: &Intersection) -> Vector3<FreeCoordinate> {
        self.object(intersection.object)
            .shape
            .normal(intersection.point, intersection.cookie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Camera, Projection};
    use crate::math::PigmentColour;
    use crate::shape::Sphere;
    use crate::texture::Finish;
    use cgmath::Point3;

    fn test_camera() -> Camera {
        Camera::looking_at(
            Projection::Perspective,
            Point3::new(0.0, 0.0, -5.0),
            Point3::new(0.0, 0.0, 0.0),
        )
    }

    fn solid_sphere(z: FreeCoordinate, colour: PigmentColour) -> Object {
        Object::new(
            Box::new(Sphere {
                center: Point3::new(0.0, 0.0, z),
                radius: 1.0,
            }),
            Texture::uniform(colour, Finish::default()),
        )
    }

    #[test]
    fn intersect_best_picks_nearest_and_honors_skip() {
        let mut scene = Scene::new(test_camera());
        let opaque = PigmentColour::new(1.0, 1.0, 1.0, 0.0, 0.0);
        let near = scene.push_object(solid_sphere(5.0, opaque));
        let far = scene.push_object(solid_sphere(10.0, opaque));

        let ray = Ray::new(Point3::new(0.0, 0.0, 0.0), cgmath::Vector3::new(0.0, 0.0, 1.0));
        let hit = scene.intersect_best(&ray, MAX_DISTANCE, None, false).unwrap();
        assert_eq!(hit.object, near);
        assert_eq!(hit.t, 4.0);

        let hit = scene
            .intersect_best(&ray, MAX_DISTANCE, Some(near), false)
            .unwrap();
        assert_eq!(hit.object, far);
    }

    #[test]
    fn opacity_derivation() {
        let opaque = solid_sphere(0.0, PigmentColour::new(1.0, 0.0, 0.0, 0.0, 0.0));
        assert!(opaque.flags.opaque);
        let filtering = solid_sphere(0.0, PigmentColour::new(1.0, 0.5, 0.0, 0.7, 0.0));
        assert!(!filtering.flags.opaque);
    }

    #[test]
    fn containing_interiors_finds_enclosing_objects() {
        let mut scene = Scene::new(test_camera());
        let opaque = PigmentColour::new(1.0, 1.0, 1.0, 0.0, 0.0);
        let with_interior =
            scene.push_object(solid_sphere(0.0, opaque).with_interior(Interior::default()));
        let _no_interior = scene.push_object(solid_sphere(0.0, opaque).without_interior());

        let inside: Vec<_> = scene.containing_interiors(Point3::new(0.0, 0.0, 0.0)).collect();
        // Only objects that own interiors are reported.
        assert_eq!(inside, vec![with_interior]);
    }
}
