//! Flat bounding volume hierarchy
//!
//! Shared building block for mesh-level (triangles) and scene-level
//! (instances) hierarchies. Nodes live in one flat array in the exact layout
//! the trace shaders consume: the root is node 0, an internal node stores the
//! index of its first child with both children adjacent, a leaf stores a run
//! into the primitive permutation.
//!
//! Splits take the dominant centroid axis at the median with a stable order,
//! so rebuilding from identical input reproduces identical output.

use candela_math::{Vec3, AABB};
use serde::{Deserialize, Serialize};

/// One node of the flat hierarchy.
///
/// `primitive_count == 0` marks an internal node whose children sit at
/// `first_index` and `first_index + 1`. Otherwise the node is a leaf covering
/// `primitive_count` entries of the primitive permutation starting at
/// `first_index`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BvhNode {
    pub min_extend: Vec3,
    pub max_extend: Vec3,
    pub first_index: u32,
    pub primitive_count: u32,
}

impl BvhNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.primitive_count > 0
    }

    #[inline]
    pub fn bounds(&self) -> AABB {
        AABB::new(self.min_extend, self.max_extend)
    }
}

/// Aggregate counters over a built hierarchy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BvhStats {
    pub node_count: usize,
    pub leaf_count: usize,
    pub max_depth: usize,
    pub max_leaf_size: usize,
}

/// Flat BVH over caller-owned primitive boxes
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Bvh {
    nodes: Vec<BvhNode>,
    primitives: Vec<u32>,
}

impl Bvh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.primitives.clear();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn nodes(&self) -> &[BvhNode] {
        &self.nodes
    }

    /// Primitive permutation; leaves index into this array
    #[inline]
    pub fn primitives(&self) -> &[u32] {
        &self.primitives
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn primitive_count(&self) -> usize {
        self.primitives.len()
    }

    #[inline]
    pub fn root(&self) -> Option<&BvhNode> {
        self.nodes.first()
    }

    /// Build the hierarchy over the given primitive boxes. Node 0 is the
    /// root. `max_depth` caps recursion; deeper runs collapse into one leaf.
    pub fn build(&mut self, boxes: &[AABB], max_depth: u32) {
        self.clear();
        if boxes.is_empty() {
            return;
        }

        self.primitives = (0..boxes.len() as u32).collect();
        let centers: Vec<Vec3> = boxes.iter().map(AABB::center).collect();

        self.nodes.push(BvhNode::default());
        self.build_node(0, 0, boxes.len(), boxes, &centers, max_depth.max(1), 1);
    }

    fn build_node(
        &mut self,
        node: usize,
        first: usize,
        count: usize,
        boxes: &[AABB],
        centers: &[Vec3],
        max_depth: u32,
        depth: u32,
    ) {
        let mut bounds = AABB::EMPTY;
        for &prim in &self.primitives[first..first + count] {
            bounds = bounds.union(&boxes[prim as usize]);
        }
        self.nodes[node].min_extend = bounds.min;
        self.nodes[node].max_extend = bounds.max;

        if count <= 1 || depth >= max_depth {
            self.nodes[node].first_index = first as u32;
            self.nodes[node].primitive_count = count as u32;
            return;
        }

        let mut center_bounds = AABB::EMPTY;
        for &prim in &self.primitives[first..first + count] {
            center_bounds = center_bounds.expand_to_include(centers[prim as usize]);
        }
        let axis = center_bounds.largest_axis();

        // stable median split keeps rebuilds deterministic
        let run = &mut self.primitives[first..first + count];
        run.sort_by(|&a, &b| {
            let ca = axis_component(centers[a as usize], axis);
            let cb = axis_component(centers[b as usize], axis);
            ca.partial_cmp(&cb)
                .unwrap_or(core::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        let half = count / 2;

        let left = self.nodes.len();
        self.nodes.push(BvhNode::default());
        self.nodes.push(BvhNode::default());
        self.nodes[node].first_index = left as u32;
        self.nodes[node].primitive_count = 0;

        self.build_node(left, first, half, boxes, centers, max_depth, depth + 1);
        self.build_node(left + 1, first + half, count - half, boxes, centers, max_depth, depth + 1);
    }

    /// Recompute node extents from updated primitive boxes without changing
    /// topology. The box slice must match the one the hierarchy was built
    /// over in length and primitive order.
    ///
    /// Children always follow their parent in the node array, so one reverse
    /// sweep refits leaves before the internal nodes above them.
    pub fn refit(&mut self, boxes: &[AABB]) {
        for index in (0..self.nodes.len()).rev() {
            let node = self.nodes[index];
            let bounds = if node.is_leaf() {
                let first = node.first_index as usize;
                let count = node.primitive_count as usize;
                let mut bounds = AABB::EMPTY;
                for &prim in &self.primitives[first..first + count] {
                    bounds = bounds.union(&boxes[prim as usize]);
                }
                bounds
            } else {
                let left = &self.nodes[node.first_index as usize];
                let right = &self.nodes[node.first_index as usize + 1];
                left.bounds().union(&right.bounds())
            };
            self.nodes[index].min_extend = bounds.min;
            self.nodes[index].max_extend = bounds.max;
        }
    }

    pub fn stats(&self) -> BvhStats {
        let mut stats = BvhStats {
            node_count: self.nodes.len(),
            ..BvhStats::default()
        };
        if self.nodes.is_empty() {
            return stats;
        }
        // (node index, depth) walk without recursion
        let mut stack = vec![(0usize, 1usize)];
        while let Some((index, depth)) = stack.pop() {
            stats.max_depth = stats.max_depth.max(depth);
            let node = &self.nodes[index];
            if node.is_leaf() {
                stats.leaf_count += 1;
                stats.max_leaf_size = stats.max_leaf_size.max(node.primitive_count as usize);
            } else {
                stack.push((node.first_index as usize, depth + 1));
                stack.push((node.first_index as usize + 1, depth + 1));
            }
        }
        stats
    }
}

#[inline]
fn axis_component(v: Vec3, axis: usize) -> f32 {
    match axis {
        0 => v.x,
        1 => v.y,
        _ => v.z,
    }
}
