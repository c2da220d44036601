// Copyright 2020-2021 Kevin Reid under the terms of the MIT License as detailed
// in the accompanying file README.md or <http://opensource.org/licenses/MIT>.

//! Spatial octree indexing cached irradiance samples.
//!
//! Node identity is the integer quadruple `(x, y, z, size)`: `size` is an
//! IEEE-biased power-of-two exponent, so a node's cube edge is
//! `2^(size-127)` world units and its nominal origin is `(x·edge − BIAS, …)`.
//! Every block stored in a node may stick out of the nominal cube by less
//! than half an edge per axis, so queries test against bounds expanded by
//! half an edge on every side.
//!
//! The coordinate bias keeps node indices positive for scenes within ten
//! million units of the origin, which keeps the parent computation's
//! floor-division in its fast path.

use cgmath::{InnerSpace as _, Point3, Vector3};
use std::io::{self, BufRead, Write};

use crate::math::{FreeCoordinate, Rgb};

/// World-coordinate offset applied before quantizing to node indices.
pub const OT_BIAS: FreeCoordinate = 10_000_000.0;

/// One cached irradiance sample. Immutable once inserted.
#[derive(Clone, Debug, PartialEq)]
pub struct OtBlock {
    pub point: Point3<FreeCoordinate>,
    /// Surface normal at the sample point.
    pub s_normal: Vector3<FreeCoordinate>,
    /// Gathered irradiance.
    pub illuminance: Rgb,
    /// Harmonic mean distance to surrounding surfaces; controls the reuse
    /// radius.
    pub harmonic_mean_distance: f32,
    /// Distance to the nearest surface seen while gathering.
    pub nearest_distance: f32,
    /// Direction toward that nearest surface.
    pub to_nearest_surface: Vector3<FreeCoordinate>,
    /// Recursion depth at which the sample was gathered (1 = primary).
    pub bounce_depth: u8,
    /// Translational color gradient: `gradient[axis]` is the per-channel
    /// rate of change of illuminance along that axis.
    pub gradient: [Vector3<f32>; 3],
}

impl OtBlock {
    /// Extrapolates the stored illuminance to a point `delta` away, clamping
    /// each channel to `[0, 1]`.
    pub fn predict(&self, delta: Vector3<FreeCoordinate>) -> Rgb {
        let d = self.gradient[0] * delta.x as f32
            + self.gradient[1] * delta.y as f32
            + self.gradient[2] * delta.z as f32;
        Rgb::new(
            (self.illuminance.red().into_inner() + d.x).clamp(0.0, 1.0),
            (self.illuminance.green().into_inner() + d.y).clamp(0.0, 1.0),
            (self.illuminance.blue().into_inner() + d.z).clamp(0.0, 1.0),
        )
    }
}

/// Identity of an octree node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeId {
    pub x: i64,
    pub y: i64,
    pub z: i64,
    /// IEEE-biased exponent of the cube edge: edge = `2^(size-127)`.
    pub size: i32,
}

impl NodeId {
    /// The cube edge length in world units.
    #[inline]
    pub fn edge(self) -> FreeCoordinate {
        // Placing the biased exponent directly into the float's exponent
        // field is exactly pow(2, size-127) with no rounding.
        f32::from_bits((self.size as u32) << 23) as FreeCoordinate
    }

    /// The id of the node's parent: one size larger, indices halved with
    /// floor-toward-negative-infinity.
    #[inline]
    pub fn parent(self) -> NodeId {
        #[inline]
        fn half(v: i64) -> i64 {
            if v > 0 {
                v >> 1
            } else {
                (v - 1) / 2
            }
        }
        NodeId {
            x: half(self.x),
            y: half(self.y),
            z: half(self.z),
            size: self.size + 1,
        }
    }

    /// Which of a parent's eight child slots this id occupies, from the
    /// parity of its indices.
    #[inline]
    pub fn child_index(self) -> usize {
        ((self.x & 1) * 4 + (self.y & 1) * 2 + (self.z & 1)) as usize
    }

    /// Whether `point` lies within this node's expanded bounds
    /// (the nominal cube grown by half an edge on every side).
    pub fn contains(self, point: Point3<FreeCoordinate>) -> bool {
        let edge = self.edge();
        let min_x = self.x as FreeCoordinate * edge - OT_BIAS;
        let min_y = self.y as FreeCoordinate * edge - OT_BIAS;
        let min_z = self.z as FreeCoordinate * edge - OT_BIAS;
        point.x >= min_x - edge * 0.5
            && point.x < min_x + edge * 1.5
            && point.y >= min_y - edge * 0.5
            && point.y < min_y + edge * 1.5
            && point.z >= min_z - edge * 0.5
            && point.z < min_z + edge * 1.5
    }

    /// The smallest node whose expanded bounds contain the sphere of
    /// influence `(center, radius)`.
    pub fn for_sphere(center: Point3<FreeCoordinate>, radius: FreeCoordinate) -> NodeId {
        let min_point = center + Vector3::new(-radius, -radius, -radius);
        let max_point = center + Vector3::new(radius, radius, radius);
        Self::for_box(min_point, max_point)
    }

    /// The smallest node whose expanded bounds contain the axis-aligned box.
    pub fn for_box(
        min_point: Point3<FreeCoordinate>,
        max_point: Point3<FreeCoordinate>,
    ) -> NodeId {
        let dx = (max_point.x - min_point.x) as f32;
        let dy = (max_point.y - min_point.y) as f32;
        let dz = (max_point.z - min_point.z) as f32;
        // Degenerate boxes index as the smallest representable cube rather
        // than looping forever below.
        let maxdel = dx.max(dy).max(dz).max(f32::MIN_POSITIVE);

        // Clearing the mantissa bits floors to the next lower power of two.
        let mut bsized = f32::from_bits(maxdel.to_bits() & 0xff80_0000) as FreeCoordinate;

        // A tiny box very far from the origin would need more index bits
        // than we have; keep doubling the node size until indices fit.
        let maxord = min_point
            .x
            .abs()
            .max(min_point.y.abs())
            .max(min_point.z.abs())
            + OT_BIAS;
        while maxord / bsized > 1.0e9 {
            bsized *= 2.0;
        }

        let mut base = NodeId {
            x: ((min_point.x + OT_BIAS) / bsized).floor() as i64,
            y: ((min_point.y + OT_BIAS) / bsized).floor() as i64,
            z: ((min_point.z + OT_BIAS) / bsized).floor() as i64,
            // The float's exponent field *is* the node size.
            size: ((bsized as f32).to_bits() >> 23) as i32,
        };

        // The box straddles up to two candidate nodes per axis at this size;
        // try all eight neighbors, else go up a level and retry.
        loop {
            for ix in 0..2 {
                for iy in 0..2 {
                    for iz in 0..2 {
                        let test = NodeId {
                            x: base.x + ix,
                            y: base.y + iy,
                            z: base.z + iz,
                            size: base.size,
                        };
                        if test.contains(min_point) && test.contains(max_point) {
                            return test;
                        }
                    }
                }
            }
            base = base.parent();
        }
    }
}

#[derive(Debug)]
struct OtNode {
    id: NodeId,
    /// Children indexed by coordinate parity (see [`NodeId::child_index`]).
    kids: [Option<Box<OtNode>>; 8],
    /// Blocks whose influence region fits this node, newest first.
    values: Vec<OtBlock>,
}

impl OtNode {
    fn new(id: NodeId) -> Self {
        OtNode {
            id,
            kids: Default::default(),
            values: Vec::new(),
        }
    }
}

/// Errors reading or writing the irradiance cache's textual form.
#[derive(Debug, thiserror::Error)]
pub enum CacheFileError {
    #[error("cache file I/O failed")]
    Io(#[from] io::Error),
    #[error("unparseable cache entry at line {line}")]
    Parse { line: usize },
}

/// Results of loading a cache file.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoadSummary {
    pub blocks: usize,
    /// Brightness recorded by a previous run, if present (`B` line).
    pub brightness: Option<FreeCoordinate>,
    /// Whether the file records that the preview pass completed (`P` line).
    pub preview_done: bool,
}

/// The octree of cached irradiance samples.
#[derive(Debug, Default)]
pub struct Octree {
    root: Option<Box<OtNode>>,
}

impl Octree {
    pub const fn new() -> Self {
        Octree { root: None }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Discards every node and block.
    pub fn clear(&mut self) {
        self.root = None;
    }

    /// Inserts `block` at the node identified by `id`, creating nodes (and
    /// growing the root upward) as needed.
    pub fn insert(&mut self, id: NodeId, block: OtBlock) {
        if self.root.is_none() {
            // First insertion; might as well make the root the right size.
            self.root = Some(Box::new(OtNode::new(id)));
        }

        // If the new block is bigger than the whole tree, grow the tree.
        while self.root.as_ref().unwrap().id.size < id.size {
            self.grow_root();
        }

        // If the block belongs to a disjoint subtree at the root's size,
        // keep growing until the subtrees merge.
        let root_id = self.root.as_ref().unwrap().id;
        let mut cursor = id;
        while cursor.size < root_id.size {
            cursor = cursor.parent();
        }
        while cursor != self.root.as_ref().unwrap().id {
            self.grow_root();
            cursor = cursor.parent();
        }

        // Now descend to the target node, creating children on the way.
        let mut node: &mut OtNode = self.root.as_deref_mut().unwrap();
        while node.id.size > id.size {
            let target_size = node.id.size - 1;
            let mut child_id = id;
            while child_id.size < target_size {
                child_id = child_id.parent();
            }
            let index = child_id.child_index();
            node = &mut **node.kids[index].get_or_insert_with(|| Box::new(OtNode::new(child_id)));
        }
        node.values.push(block);
    }

    /// Replaces the root with a parent one size up, the old root occupying
    /// the child slot given by its coordinate parity.
    fn grow_root(&mut self) {
        let old = self.root.take().unwrap();
        let mut new_root = OtNode::new(old.id.parent());
        let index = old.id.child_index();
        new_root.kids[index] = Some(old);
        self.root = Some(Box::new(new_root));
    }

    /// Visits every block of the given bounce depth in every node whose
    /// expanded bounds contain `point`, small nodes before their parents.
    /// The visitor returns whether to continue; the final return value is
    /// `false` if the visitor stopped the traversal.
    pub fn dist_traverse(
        &self,
        point: Point3<FreeCoordinate>,
        bounce_depth: u8,
        visit: &mut dyn FnMut(&OtBlock) -> bool,
    ) -> bool {
        fn recurse(
            node: &OtNode,
            point: Point3<FreeCoordinate>,
            bounce_depth: u8,
            visit: &mut dyn FnMut(&OtBlock) -> bool,
        ) -> bool {
            for kid in node.kids.iter().flatten() {
                if kid.id.contains(point) && !recurse(kid, point, bounce_depth, visit) {
                    return false;
                }
            }
            for block in node.values.iter().rev() {
                if block.bounce_depth == bounce_depth && !visit(block) {
                    return false;
                }
            }
            true
        }
        match &self.root {
            Some(root) => recurse(root, point, bounce_depth, visit),
            None => true,
        }
    }

    /// Visits every block in the tree regardless of position or depth.
    pub fn traverse(&self, visit: &mut dyn FnMut(&OtBlock) -> bool) -> bool {
        fn recurse(node: &OtNode, visit: &mut dyn FnMut(&OtBlock) -> bool) -> bool {
            for kid in node.kids.iter().flatten() {
                if !recurse(kid, visit) {
                    return false;
                }
            }
            node.values.iter().rev().all(|block| visit(block))
        }
        match &self.root {
            Some(root) => recurse(root, visit),
            None => true,
        }
    }

    /// Writes every depth-1 block in the tree to `writer` in the textual
    /// cache format.
    pub fn save(&self, writer: &mut dyn Write) -> Result<(), CacheFileError> {
        let mut result = Ok(());
        self.traverse(&mut |block| {
            if block.bounce_depth == 1 {
                if let Err(error) = write_block(writer, block) {
                    result = Err(error);
                    return false;
                }
            }
            true
        });
        result
    }

    /// Reads a cache file previously produced by [`Self::save`] (plus the
    /// `B` and `P` markers written around the preview pass), adding every
    /// block to this tree. `error_bound` re-derives each block's node from
    /// its harmonic mean distance.
    ///
    /// Unrecognized lines are skipped, matching the forgiving reader this
    /// format has always had.
    pub fn load(
        &mut self,
        reader: &mut dyn BufRead,
        error_bound: FreeCoordinate,
    ) -> Result<LoadSummary, CacheFileError> {
        let mut summary = LoadSummary::default();
        for (line_index, line) in reader.lines().enumerate() {
            let line = line?;
            match line.chars().next() {
                Some('B') => {
                    if let Ok(brightness) = line[1..].trim().parse() {
                        summary.brightness = Some(brightness);
                    }
                }
                Some('P') => {
                    summary.preview_done = true;
                }
                Some('C') => {
                    let block = parse_block(&line[1..]).ok_or(CacheFileError::Parse {
                        line: line_index + 1,
                    })?;
                    let id = NodeId::for_sphere(
                        block.point,
                        block.harmonic_mean_distance as FreeCoordinate * error_bound,
                    );
                    self.insert(id, block);
                    summary.blocks += 1;
                }
                // Wrong leading character; just try the next line.
                _ => {}
            }
        }
        Ok(summary)
    }
}

/// Writes a single block in the textual cache format. Exposed so a cache
/// file can also be appended to block-by-block while rendering.
pub fn write_block(writer: &mut dyn Write, block: &OtBlock) -> Result<(), CacheFileError> {
    writeln!(
        writer,
        "C{}\t{}\t{}\t{}\t{}\t{:.4}\t{:.4}\t{:.4}\t{}\t{}\t{}",
        block.bounce_depth,
        block.point.x,
        block.point.y,
        block.point.z,
        pack_vector(block.s_normal),
        block.illuminance.red().into_inner(),
        block.illuminance.green().into_inner(),
        block.illuminance.blue().into_inner(),
        block.harmonic_mean_distance,
        block.nearest_distance,
        pack_vector(block.to_nearest_surface),
    )?;
    Ok(())
}

/// Packs a unit vector into six hex digits, 8 bits per axis.
fn pack_vector(v: Vector3<FreeCoordinate>) -> String {
    #[inline]
    fn pack(c: FreeCoordinate) -> u32 {
        ((c + 1.0) * 0.5 * 254.0 + 0.499999) as u32
    }
    format!("{:02x}{:02x}{:02x}", pack(v.x), pack(v.y), pack(v.z))
}

/// Inverse of [`pack_vector`]; renormalizes to shed quantization error.
fn unpack_vector(s: &str) -> Option<Vector3<FreeCoordinate>> {
    if s.len() != 6 {
        return None;
    }
    let decode = |range: std::ops::Range<usize>| -> Option<FreeCoordinate> {
        let byte = u32::from_str_radix(&s[range], 16).ok()?;
        Some(byte as FreeCoordinate * (1.0 / 254.0) * 2.0 - 1.0)
    };
    let v = Vector3::new(decode(0..2)?, decode(2..4)?, decode(4..6)?);
    Some(v.normalize())
}

fn parse_block(line: &str) -> Option<OtBlock> {
    let mut fields = line.split_whitespace();
    let bounce_depth: u8 = fields.next()?.parse().ok()?;
    let mut coord = || -> Option<FreeCoordinate> { fields.next()?.parse().ok() };
    let point = Point3::new(coord()?, coord()?, coord()?);
    let s_normal = unpack_vector(fields.next()?)?;
    let r: f32 = fields.next()?.parse().ok()?;
    let g: f32 = fields.next()?.parse().ok()?;
    let b: f32 = fields.next()?.parse().ok()?;
    let harmonic_mean_distance: f32 = fields.next()?.parse().ok()?;
    let nearest_distance: f32 = fields.next()?.parse().ok()?;
    let to_nearest_surface = unpack_vector(fields.next()?)?;
    Some(OtBlock {
        point,
        s_normal,
        illuminance: Rgb::new(r, g, b),
        harmonic_mean_distance,
        nearest_distance,
        to_nearest_surface,
        bounce_depth,
        gradient: [Vector3::new(0.0, 0.0, 0.0); 3],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_block(point: Point3<FreeCoordinate>, depth: u8) -> OtBlock {
        OtBlock {
            point,
            s_normal: Vector3::new(0.0, 1.0, 0.0),
            illuminance: Rgb::new(0.5, 0.25, 0.125),
            harmonic_mean_distance: 1.0,
            nearest_distance: 0.5,
            to_nearest_surface: Vector3::new(0.0, 0.0, 1.0),
            bounce_depth: depth,
            gradient: [Vector3::new(0.0, 0.0, 0.0); 3],
        }
    }

    #[test]
    fn edge_lengths_are_powers_of_two() {
        assert_eq!(NodeId { x: 0, y: 0, z: 0, size: 127 }.edge(), 1.0);
        assert_eq!(NodeId { x: 0, y: 0, z: 0, size: 128 }.edge(), 2.0);
        assert_eq!(NodeId { x: 0, y: 0, z: 0, size: 126 }.edge(), 0.5);
    }

    #[test]
    fn parent_halves_toward_negative_infinity() {
        let id = NodeId { x: 3, y: -3, z: -4, size: 127 };
        let parent = id.parent();
        assert_eq!((parent.x, parent.y, parent.z, parent.size), (1, -2, -2, 128));
    }

    #[test]
    fn sphere_fits_inside_chosen_node() {
        // Invariant: every block's influence sphere fits inside its node's
        // expanded bounds.
        for &(center, radius) in &[
            (Point3::new(0.49, 0.49, 0.49), 1.0),
            (Point3::new(-3.7, 12.25, 0.01), 0.35),
            (Point3::new(1000.0, -2000.0, 5.5), 17.0),
            (Point3::new(0.0, 0.0, 0.0), 1.0e-4),
        ] {
            let id = NodeId::for_sphere(center, radius);
            let offset = Vector3::new(radius, radius, radius);
            assert!(id.contains(center + offset), "max corner in {:?}", id);
            assert!(id.contains(center + -offset), "min corner in {:?}", id);
        }
    }

    #[test]
    fn far_and_tiny_spheres_get_bigger_nodes() {
        // A millimeter-scale sphere a few thousand kilometers out must not
        // overflow the integer indices.
        let center = Point3::new(4.0e9, 0.0, 0.0);
        let id = NodeId::for_sphere(center, 1.0e-3);
        assert!(id.contains(center));
        assert!(id.edge() >= (center.x + OT_BIAS) / 1.0e9);
    }

    #[test]
    fn insert_and_query_prunes_by_position() {
        let mut tree = Octree::new();
        let near = Point3::new(0.5, 0.5, 0.5);
        let far = Point3::new(500.0, 0.0, 0.0);
        tree.insert(NodeId::for_sphere(near, 1.0), test_block(near, 1));
        tree.insert(NodeId::for_sphere(far, 1.0), test_block(far, 1));

        let mut seen = Vec::new();
        tree.dist_traverse(near, 1, &mut |block| {
            seen.push(block.point);
            true
        });
        assert_eq!(seen, vec![near]);
    }

    #[test]
    fn query_filters_on_bounce_depth() {
        let mut tree = Octree::new();
        let p = Point3::new(0.0, 0.0, 0.0);
        tree.insert(NodeId::for_sphere(p, 1.0), test_block(p, 1));
        tree.insert(NodeId::for_sphere(p, 1.0), test_block(p, 2));

        let mut count = 0;
        tree.dist_traverse(p, 2, &mut |_| {
            count += 1;
            true
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn visitor_can_abort() {
        let mut tree = Octree::new();
        let p = Point3::new(0.0, 0.0, 0.0);
        for _ in 0..4 {
            tree.insert(NodeId::for_sphere(p, 1.0), test_block(p, 1));
        }
        let mut count = 0;
        let finished = tree.dist_traverse(p, 1, &mut |_| {
            count += 1;
            false
        });
        assert!(!finished);
        assert_eq!(count, 1);
    }

    #[test]
    fn root_grows_to_cover_disjoint_subtrees() {
        let mut tree = Octree::new();
        let a = Point3::new(0.5, 0.5, 0.5);
        let b = Point3::new(-40.0, 33.0, 7.0);
        tree.insert(NodeId::for_sphere(a, 0.25), test_block(a, 1));
        tree.insert(NodeId::for_sphere(b, 0.25), test_block(b, 1));

        let mut seen_a = 0;
        tree.dist_traverse(a, 1, &mut |_| {
            seen_a += 1;
            true
        });
        assert_eq!(seen_a, 1);
        let mut seen_b = 0;
        tree.dist_traverse(b, 1, &mut |_| {
            seen_b += 1;
            true
        });
        assert_eq!(seen_b, 1);
    }

    #[test]
    fn save_load_round_trip() {
        let mut tree = Octree::new();
        let p = Point3::new(1.25, -2.5, 3.75);
        let normal = Vector3::new(0.6, 0.8, 0.0);
        let mut block = test_block(p, 1);
        block.s_normal = normal;
        tree.insert(NodeId::for_sphere(p, 0.4), block.clone());
        // Depth-2 blocks are not persisted.
        tree.insert(NodeId::for_sphere(p, 0.4), test_block(p, 2));

        let mut buffer = Vec::new();
        tree.save(&mut buffer).unwrap();

        let mut reloaded = Octree::new();
        let summary = reloaded
            .load(&mut io::Cursor::new(&buffer), 0.4)
            .unwrap();
        assert_eq!(summary.blocks, 1);

        let mut blocks = Vec::new();
        reloaded.traverse(&mut |b| {
            blocks.push(b.clone());
            true
        });
        assert_eq!(blocks.len(), 1);
        let reloaded_block = &blocks[0];
        assert_eq!(reloaded_block.point, block.point);
        assert_eq!(reloaded_block.illuminance, block.illuminance);
        assert_eq!(
            reloaded_block.harmonic_mean_distance,
            block.harmonic_mean_distance
        );
        // Normals are stored with 8 bits per axis; ≤1% directional error.
        assert!((reloaded_block.s_normal - normal.normalize()).magnitude() < 0.01);
    }

    #[test]
    fn load_reports_markers_and_tolerates_junk() {
        let text = "B3.25\nnonsense line\nP\n";
        let mut tree = Octree::new();
        let summary = tree
            .load(&mut io::Cursor::new(text.as_bytes()), 0.4)
            .unwrap();
        assert_eq!(summary.brightness, Some(3.25));
        assert!(summary.preview_done);
        assert_eq!(summary.blocks, 0);
        assert!(tree.is_empty());
    }

    #[test]
    fn pack_precision_round_trip() {
        for &v in &[
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.577, -0.577, 0.577),
            Vector3::new(-1.0, 0.0, 0.0),
        ] {
            let v = v.normalize();
            let unpacked = unpack_vector(&pack_vector(v)).unwrap();
            assert!((unpacked - v).magnitude() < 0.01, "{:?} vs {:?}", v, unpacked);
        }
    }
}
