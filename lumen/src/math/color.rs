// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! Color data types. This module is private but reexported by its parent.

use cgmath::{ElementWise as _, Vector3, Vector4};
pub use ordered_float::{FloatIsNan, NotNan};
use std::convert::{TryFrom, TryInto};
use std::ops::{Add, AddAssign, Mul, Sub};

/// RGB magnitudes below this threshold are treated as zero for early-out
/// tests throughout the shading core.
pub const BLACK_LEVEL: f32 = 0.003;

/// Allows writing a constant [`Rgb`] color value, provided that its components are float
/// literals.
#[macro_export]
macro_rules! rgb_const {
    ($r:literal, $g:literal, $b:literal) => {
        unsafe {
            // Safety: Only literal values are allowed, which will either be a non-NaN
            // float or a type mismatch.
            $crate::math::Rgb::new_nn(
                $crate::math::NotNan::unchecked_new($r),
                $crate::math::NotNan::unchecked_new($g),
                $crate::math::NotNan::unchecked_new($b),
            )
        }
    };
}

/// A floating-point RGB color value.
///
/// * Each component may be considered to have a nominal range of 0 to 1, but larger
///   values are permitted — corresponding to bright light sources and other such
///   things which it is reasonable to “overexpose”. (No meaning is given to negative
///   values, but they are permitted.)
/// * NaN is banned so that [`Eq`] may be implemented. (Infinities are permitted.)
/// * Color values are linear (gamma = 1).
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Rgb(Vector3<NotNan<f32>>);

/// A floating-point RGB color value carrying a transmittance in its fourth
/// channel.
///
/// The fourth channel is *not* coverage-style alpha: it is the fraction of the
/// background that shows through uncolored, accumulated multiplicatively
/// across texture layers, and it becomes the alpha channel of the output
/// image. A freshly started ray has transmittance 1.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Rgba(Vector4<NotNan<f32>>);

// NotNan::zero() and one() exist, but only via traits, which can't be used in const
const NN0: NotNan<f32> = unsafe { NotNan::unchecked_new(0.0) };
const NN1: NotNan<f32> = unsafe { NotNan::unchecked_new(1.0) };

impl Rgb {
    /// Black.
    pub const ZERO: Rgb = Rgb(Vector3::new(NN0, NN0, NN0));
    /// White (unity brightness).
    pub const ONE: Rgb = Rgb(Vector3::new(NN1, NN1, NN1));

    /// Constructs a color from components. Panics if any component is NaN.
    /// No other range checks are performed.
    #[inline]
    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Self::try_from(Vector3::new(r, g, b)).expect("Color components may not be NaN")
    }

    /// Constructs a color from components that have already been checked for not being
    /// NaN.
    ///
    /// Note: This exists primarily to assist the [`rgb_const!`] macro and may be renamed
    /// or replaced in future versions.
    #[inline]
    pub const fn new_nn(r: NotNan<f32>, g: NotNan<f32>, b: NotNan<f32>) -> Self {
        Self(Vector3::new(r, g, b))
    }

    /// Adds a transmittance component to produce an [`Rgba`] color.
    #[inline]
    pub const fn with_transmittance(self, transmittance: NotNan<f32>) -> Rgba {
        Rgba(Vector4::new(self.0.x, self.0.y, self.0.z, transmittance))
    }

    /// Returns the red color component. Values are linear (gamma = 1).
    #[inline]
    pub const fn red(self) -> NotNan<f32> {
        self.0.x
    }
    /// Returns the green color component. Values are linear (gamma = 1).
    #[inline]
    pub const fn green(self) -> NotNan<f32> {
        self.0.y
    }
    /// Returns the blue color component. Values are linear (gamma = 1).
    #[inline]
    pub const fn blue(self) -> NotNan<f32> {
        self.0.z
    }

    /// The largest of the three components.
    #[inline]
    pub fn max_component(self) -> f32 {
        self.0.x.max(self.0.y).max(self.0.z).into_inner()
    }

    /// Perceptual gray value using the traditional .287/.589/.114 weights.
    #[inline]
    pub fn grey(self) -> f32 {
        self.0.x.into_inner() * 0.287
            + self.0.y.into_inner() * 0.589
            + self.0.z.into_inner() * 0.114
    }

    /// Whether every component magnitude is below [`BLACK_LEVEL`].
    #[inline]
    pub fn is_black(self) -> bool {
        self.0.x.into_inner().abs() < BLACK_LEVEL
            && self.0.y.into_inner().abs() < BLACK_LEVEL
            && self.0.z.into_inner().abs() < BLACK_LEVEL
    }

    /// Clamps each component to the unit interval.
    #[inline]
    pub fn clamp01(self) -> Self {
        Self(self.0.map(|c| c.min(NN1).max(NN0)))
    }

    /// Raises each component (clamped below at zero) to the given power.
    /// The identity exponent is special-cased since it is the common case.
    #[inline]
    pub fn powf(self, exponent: f32) -> Self {
        if exponent == 1.0 {
            self
        } else {
            Self(
                self.0
                    .map(|c| NotNan::new(c.into_inner().max(0.0).powf(exponent)).unwrap()),
            )
        }
    }
}

impl Rgba {
    /// Transparent black: zero color, full transmittance. This is the state of
    /// a ray color before anything has been traced.
    pub const CLEAR: Rgba = Rgba(Vector4::new(NN0, NN0, NN0, NN1));
    /// Black with no transmittance.
    pub const BLACK: Rgba = Rgba(Vector4::new(NN0, NN0, NN0, NN0));

    /// Constructs a color from components. Panics if any component is NaN.
    /// No other range checks are performed.
    #[inline]
    pub fn new(r: f32, g: f32, b: f32, t: f32) -> Self {
        Self::try_from(Vector4::new(r, g, b, t)).expect("Color components may not be NaN")
    }

    /// Returns the red color component. Values are linear (gamma = 1).
    #[inline]
    pub const fn red(self) -> NotNan<f32> {
        self.0.x
    }
    /// Returns the green color component. Values are linear (gamma = 1).
    #[inline]
    pub const fn green(self) -> NotNan<f32> {
        self.0.y
    }
    /// Returns the blue color component. Values are linear (gamma = 1).
    #[inline]
    pub const fn blue(self) -> NotNan<f32> {
        self.0.z
    }
    /// Returns the transmittance component.
    #[inline]
    pub const fn transmittance(self) -> NotNan<f32> {
        self.0.w
    }

    /// Discards the transmittance component to produce an RGB color.
    #[inline]
    pub fn to_rgb(self) -> Rgb {
        Rgb(self.0.truncate())
    }

    /// Replaces the RGB part, keeping transmittance.
    #[inline]
    pub fn with_rgb(self, rgb: Rgb) -> Rgba {
        rgb.with_transmittance(self.0.w)
    }

    /// Clamps every channel, transmittance included, to the unit interval.
    #[inline]
    pub fn clamp01(self) -> Self {
        Self(self.0.map(|c| c.min(NN1).max(NN0)))
    }

    // TODO: This and the code depending on it should use [u8; 4] instead.
    /// Converts this color lossily to linear 8-bits-per-component color.
    #[inline]
    pub fn to_saturating_32bit(self) -> (u8, u8, u8, u8) {
        #[inline]
        fn convert_component(x: NotNan<f32>) -> u8 {
            // As of Rust 1.45, `as` on float to int is saturating
            (x.into_inner() * 255.0) as u8
        }
        (
            convert_component(self.red()),
            convert_component(self.green()),
            convert_component(self.blue()),
            convert_component(self.transmittance()),
        )
    }
}

/// The color+filter+transmit quintuple produced by evaluating a pigment.
///
/// `filter` tints whatever shows through by the pigment's own color;
/// `transmit` passes it through uncolored. Layer compositing multiplies these
/// channel-wise, and the shadow-mode texture evaluator hands the whole
/// quintuple back as the attenuation of a light ray.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PigmentColour {
    pub rgb: Rgb,
    pub filter: f32,
    pub transmit: f32,
}

impl PigmentColour {
    /// All channels 1; the identity for layer-filter accumulation.
    pub const WHITE: PigmentColour = PigmentColour {
        rgb: Rgb::ONE,
        filter: 1.0,
        transmit: 1.0,
    };

    #[inline]
    pub fn new(r: f32, g: f32, b: f32, filter: f32, transmit: f32) -> Self {
        PigmentColour {
            rgb: Rgb::new(r, g, b),
            filter,
            transmit,
        }
    }

    /// A plain opaque color.
    #[inline]
    pub fn opaque(rgb: Rgb) -> Self {
        PigmentColour {
            rgb,
            filter: 0.0,
            transmit: 0.0,
        }
    }

    /// Channel-wise product of all five channels.
    #[inline]
    pub fn filter_by(&mut self, other: &PigmentColour) {
        self.rgb = self.rgb * other.rgb;
        self.filter *= other.filter;
        self.transmit *= other.transmit;
    }

    /// `|filter| + |transmit|`: how much light continues past this color at
    /// all. The magnitudes guard against user-authored negative channels.
    #[inline]
    pub fn translucency(&self) -> f32 {
        self.filter.abs() + self.transmit.abs()
    }

    /// The fraction of incoming light this layer keeps for itself,
    /// `1 − min(1, filter + transmit)`.
    #[inline]
    pub fn opacity(&self) -> f32 {
        1.0 - (self.filter + self.transmit).min(1.0)
    }
}

/// Difference metric used for anti-aliasing and area-light agreement tests:
/// the sum of absolute channel differences.
#[inline]
pub fn colour_distance(a: Rgb, b: Rgb) -> f32 {
    (a.red().into_inner() - b.red().into_inner()).abs()
        + (a.green().into_inner() - b.green().into_inner()).abs()
        + (a.blue().into_inner() - b.blue().into_inner()).abs()
}

impl From<Vector3<NotNan<f32>>> for Rgb {
    fn from(value: Vector3<NotNan<f32>>) -> Self {
        Self(value)
    }
}

impl From<Rgb> for Vector3<f32> {
    fn from(value: Rgb) -> Self {
        value.0.map(NotNan::into_inner)
    }
}
impl From<Rgba> for Vector4<f32> {
    fn from(value: Rgba) -> Self {
        value.0.map(NotNan::into_inner)
    }
}

impl TryFrom<Vector3<f32>> for Rgb {
    type Error = FloatIsNan;
    fn try_from(value: Vector3<f32>) -> Result<Self, Self::Error> {
        Ok(Self(Vector3::new(
            value.x.try_into()?,
            value.y.try_into()?,
            value.z.try_into()?,
        )))
    }
}
impl TryFrom<Vector4<f32>> for Rgba {
    type Error = FloatIsNan;
    fn try_from(value: Vector4<f32>) -> Result<Self, Self::Error> {
        Ok(Self(Vector4::new(
            value.x.try_into()?,
            value.y.try_into()?,
            value.z.try_into()?,
            value.w.try_into()?,
        )))
    }
}

impl Add<Rgb> for Rgb {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}
impl AddAssign<Rgb> for Rgb {
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}
impl Sub<Rgb> for Rgb {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self(self.0 - other.0)
    }
}
/// Multiplies two color values componentwise.
impl Mul<Rgb> for Rgb {
    type Output = Self;
    /// Multiplies two color values componentwise.
    fn mul(self, other: Rgb) -> Self {
        Self(self.0.mul_element_wise(other.0))
    }
}
/// Multiplies this color value by a scalar.
impl Mul<NotNan<f32>> for Rgb {
    type Output = Self;
    /// Multiplies this color value by a scalar.
    fn mul(self, scalar: NotNan<f32>) -> Self {
        Self(self.0 * scalar)
    }
}
/// Multiplies this color value by a scalar. Panics if the scalar is NaN.
impl Mul<f32> for Rgb {
    type Output = Self;
    /// Multiplies this color value by a scalar. Panics if the scalar is NaN.
    fn mul(self, scalar: f32) -> Self {
        Self(self.0 * NotNan::new(scalar).unwrap())
    }
}

impl std::fmt::Debug for Rgb {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "Rgb({:?}, {:?}, {:?})",
            self.red().into_inner(),
            self.green().into_inner(),
            self.blue().into_inner()
        )
    }
}
impl std::fmt::Debug for Rgba {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "Rgba({:?}, {:?}, {:?}, t={:?})",
            self.red().into_inner(),
            self.green().into_inner(),
            self.blue().into_inner(),
            self.transmittance().into_inner()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_to_saturating_32bit() {
        assert_eq!(
            Rgba::new(0.125, 0.25, 0.5, 0.75).to_saturating_32bit(),
            (31, 63, 127, 191)
        );

        // Test saturation
        assert_eq!(
            Rgba::new(0.5, -1.0, 10.0, 1.0).to_saturating_32bit(),
            (127, 0, 255, 255)
        );
    }

    #[test]
    fn rgb_rgba_debug() {
        assert_eq!(
            format!("{:#?}", Rgb::new(0.1, 0.2, 0.3)),
            "Rgb(0.1, 0.2, 0.3)"
        );
        assert_eq!(
            format!("{:#?}", Rgba::new(0.1, 0.2, 0.3, 0.4)),
            "Rgba(0.1, 0.2, 0.3, t=0.4)"
        );
    }

    #[test]
    fn black_level_test_uses_magnitude() {
        assert!(Rgb::new(0.002, -0.002, 0.0).is_black());
        assert!(!Rgb::new(0.002, -0.004, 0.0).is_black());
    }

    #[test]
    fn powf_identity_and_clamp() {
        let c = Rgb::new(0.5, -0.25, 2.0);
        assert_eq!(c.powf(1.0), c);
        // Negative components clamp to zero before exponentiation rather
        // than producing NaN.
        assert_eq!(c.powf(0.5), Rgb::new(0.5f32.sqrt(), 0.0, 2.0f32.sqrt()));
    }

    #[test]
    fn pigment_filtering() {
        let mut fil = PigmentColour::WHITE;
        fil.filter_by(&PigmentColour::new(1.0, 0.5, 0.0, 0.7, 0.0));
        assert_eq!(fil.rgb, Rgb::new(1.0, 0.5, 0.0));
        assert_eq!(fil.filter, 0.7);
        assert_eq!(fil.transmit, 0.0);
        assert_eq!(fil.translucency(), 0.7);
        assert!((fil.opacity() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn colour_distance_is_abs_sum() {
        let d = colour_distance(Rgb::new(1.0, 0.0, 0.25), Rgb::new(0.5, 0.25, 0.25));
        assert!((d - 0.75).abs() < 1e-6);
    }
}
