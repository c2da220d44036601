// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! Lumen is the shading and global-illumination core of a classical
//! recursive ray tracer: given a camera ray and scene geometry, it computes
//! the radiance visible along that ray — layered-texture shading with
//! recursive reflection and refraction, filtered shadows with per-light
//! caching and adaptive area-light sampling, a Ward-style irradiance cache
//! over a spatial octree, and adaptive, mosaic-preview and focal-blur pixel
//! samplers.
//!
//! Geometry, pattern evaluation, and image output remain the caller's
//! business: shapes implement a narrow capability trait, pigments and
//! patterns are pluggable, and finished scanlines leave through a
//! [`render::FrameSink`].

#![allow(clippy::collapsible_if)]
#![warn(clippy::cast_lossless)]

pub mod blur;
pub mod camera;
pub mod light;
pub mod math;
pub mod octree;
pub mod options;
pub mod radiosity;
pub mod ray;
pub mod render;
pub mod scene;
pub mod shade;
pub mod shadow;
pub mod shape;
pub mod texture;
pub mod trace;
