// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! Rays and the stack of object interiors a ray is currently travelling
//! through.

use cgmath::{Point3, Vector3};
use std::fmt;

use crate::math::FreeCoordinate;
use crate::scene::ObjectId;

/// Hard cap on how deeply interiors may nest along one ray. Exceeding it is a
/// structural scene error and aborts the frame.
pub const MAX_NESTED_INTERIORS: usize = 100;

/// Error returned when a ray would enter more than [`MAX_NESTED_INTERIORS`]
/// interiors at once.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("too many nested object interiors (more than {})", MAX_NESTED_INTERIORS)]
pub struct TooManyInteriors;

/// An ordered list of the interiors (identified by their owning object) that
/// a ray is currently inside.
///
/// Order matters: the most recently entered interior is last, and refraction
/// consults the innermost entry to decide which medium the ray is leaving
/// into. Membership tests treat it as a set.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InteriorStack(Vec<ObjectId>);

impl InteriorStack {
    pub const fn new() -> Self {
        InteriorStack(Vec::new())
    }

    /// True if the ray is in the atmosphere, inside no interior at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The interior most recently entered, if any.
    #[inline]
    pub fn innermost(&self) -> Option<ObjectId> {
        self.0.last().copied()
    }

    /// Position of the given object's interior in the stack, if the ray is
    /// inside it.
    #[inline]
    pub fn position_of(&self, id: ObjectId) -> Option<usize> {
        self.0.iter().position(|&x| x == id)
    }

    /// Records that the ray entered the given object's interior.
    pub fn enter(&mut self, id: ObjectId) -> Result<(), TooManyInteriors> {
        if self.0.len() >= MAX_NESTED_INTERIORS {
            return Err(TooManyInteriors);
        }
        self.0.push(id);
        Ok(())
    }

    /// Removes the entry at `position` (as returned by
    /// [`Self::position_of`]); the ray has left that interior.
    pub fn exit(&mut self, position: usize) {
        self.0.remove(position);
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.0.iter().copied()
    }
}

/// A ray in the process of being traced: origin, unit direction, and the
/// interiors it is inside. The recursion level and ADC weight ride along in
/// the trace state rather than the ray itself.
#[derive(Clone, Debug, PartialEq)]
pub struct Ray {
    pub origin: Point3<FreeCoordinate>,
    /// Unit direction vector.
    pub direction: Vector3<FreeCoordinate>,
    pub interiors: InteriorStack,
}

impl Ray {
    pub fn new(origin: Point3<FreeCoordinate>, direction: Vector3<FreeCoordinate>) -> Self {
        Ray {
            origin,
            direction,
            interiors: InteriorStack::new(),
        }
    }

    /// Constructs a secondary ray continuing from `origin`, inheriting this
    /// ray's interior stack.
    pub fn continued(&self, origin: Point3<FreeCoordinate>, direction: Vector3<FreeCoordinate>) -> Self {
        Ray {
            origin,
            direction,
            interiors: self.interiors.clone(),
        }
    }

    /// The point at parametric distance `t` along the ray.
    #[inline]
    pub fn at(&self, t: FreeCoordinate) -> Point3<FreeCoordinate> {
        self.origin + self.direction * t
    }
}

impl fmt::Display for Ray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin: [FreeCoordinate; 3] = self.origin.into();
        let direction: [FreeCoordinate; 3] = self.direction.into();
        write!(f, "Ray({:.3?} toward {:.3?})", origin, direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{EuclideanSpace as _, Point3, Vector3};

    #[test]
    fn interior_stack_enter_exit() {
        let mut stack = InteriorStack::new();
        assert!(stack.is_empty());
        stack.enter(ObjectId(3)).unwrap();
        stack.enter(ObjectId(7)).unwrap();
        assert_eq!(stack.innermost(), Some(ObjectId(7)));
        assert_eq!(stack.position_of(ObjectId(3)), Some(0));
        assert_eq!(stack.position_of(ObjectId(9)), None);
        stack.exit(0);
        assert_eq!(stack.innermost(), Some(ObjectId(7)));
        assert_eq!(stack.position_of(ObjectId(3)), None);
    }

    #[test]
    fn interior_stack_overflow_is_an_error() {
        let mut stack = InteriorStack::new();
        for i in 0..MAX_NESTED_INTERIORS {
            stack.enter(ObjectId(i)).unwrap();
        }
        assert_eq!(stack.enter(ObjectId(usize::MAX)), Err(TooManyInteriors));
    }

    #[test]
    fn ray_at() {
        let ray = Ray::new(Point3::origin(), Vector3::new(0.0, 0.0, 1.0));
        assert_eq!(ray.at(2.5), Point3::new(0.0, 0.0, 2.5));
    }
}
