//! Bulk-loaded 2D point index with axis-aligned rectangle queries.
//!
//! The tree indexes sample *indices*, never coordinates: nodes live in a
//! flat arena and leaves hold `u32` indices into the caller's parallel
//! X/Y arrays. Both construction and queries therefore take the arrays
//! as arguments; the caller must pass the same arrays to both (the
//! context owns the arrays and the tree, so this holds by construction).
//!
//! Built once per context, then read-only and freely shared across
//! worker threads.

/// An axis-aligned rectangle with inclusive extents.
#[derive(Copy, Clone, Debug, Default)]
pub struct Rect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Rect {
    #[inline]
    pub fn intersects(&self, other: &Rect) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    #[inline]
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// Leaves split once they hold more points than this.
const MAX_LEAF_POINTS: usize = 8;
/// Hard depth cap; coincident points stop splitting here.
const MAX_DEPTH: usize = 32;

#[derive(Debug)]
struct Node {
    bounds: Rect,
    /// Arena indices of the four children, or `None` for a leaf.
    children: Option<[u32; 4]>,
    /// Sample indices, populated in leaves only.
    points: Vec<u32>,
}

/// A bulk-loaded point quadtree over `{(x[i], y[i], i)}`.
#[derive(Debug)]
pub struct QuadTree {
    nodes: Vec<Node>,
    bounds: Rect,
}

impl QuadTree {
    /// Build the tree over all samples. The global extent is the point
    /// bounding box.
    pub fn build(x: &[f64], y: &[f64]) -> Self {
        debug_assert_eq!(x.len(), y.len());
        let bounds = point_bounds(x, y);
        let root = Node {
            bounds,
            children: None,
            points: (0..x.len() as u32).collect(),
        };
        let mut tree = Self { nodes: vec![root], bounds };

        let mut pending = vec![(0usize, 0usize)];
        while let Some((node_idx, depth)) = pending.pop() {
            if tree.nodes[node_idx].points.len() <= MAX_LEAF_POINTS || depth >= MAX_DEPTH {
                continue;
            }
            let first_child = tree.split(node_idx, x, y);
            for k in 0..4 {
                pending.push((first_child + k, depth + 1));
            }
        }
        tree
    }

    /// The bounding box of the indexed point set.
    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    /// Collect into `out` the indices of all samples inside `rect`, in
    /// deterministic traversal order. `out` is cleared first so callers
    /// can reuse the buffer across cells.
    pub fn query(&self, x: &[f64], y: &[f64], rect: &Rect, out: &mut Vec<u32>) {
        out.clear();
        let mut stack = vec![0usize];
        while let Some(node_idx) = stack.pop() {
            let node = &self.nodes[node_idx];
            if !node.bounds.intersects(rect) {
                continue;
            }
            match node.children {
                Some(children) => {
                    // Reverse push keeps visiting order 0..4.
                    for &c in children.iter().rev() {
                        stack.push(c as usize);
                    }
                }
                None => {
                    for &i in &node.points {
                        if rect.contains_point(x[i as usize], y[i as usize]) {
                            out.push(i);
                        }
                    }
                }
            }
        }
    }

    /// Turn `node_idx` into an interior node, distributing its points
    /// into four fresh children. Returns the arena index of the first
    /// child.
    fn split(&mut self, node_idx: usize, x: &[f64], y: &[f64]) -> usize {
        let bounds = self.nodes[node_idx].bounds;
        let cx = 0.5 * (bounds.min_x + bounds.max_x);
        let cy = 0.5 * (bounds.min_y + bounds.max_y);
        let quadrants = [
            Rect { min_x: bounds.min_x, min_y: bounds.min_y, max_x: cx, max_y: cy },
            Rect { min_x: cx, min_y: bounds.min_y, max_x: bounds.max_x, max_y: cy },
            Rect { min_x: bounds.min_x, min_y: cy, max_x: cx, max_y: bounds.max_y },
            Rect { min_x: cx, min_y: cy, max_x: bounds.max_x, max_y: bounds.max_y },
        ];

        let points = std::mem::take(&mut self.nodes[node_idx].points);
        let mut buckets: [Vec<u32>; 4] = Default::default();
        for i in points {
            // Half-open split at the center assigns each point to
            // exactly one quadrant.
            let east = x[i as usize] >= cx;
            let north = y[i as usize] >= cy;
            let q = (north as usize) << 1 | east as usize;
            buckets[q].push(i);
        }

        let first_child = self.nodes.len();
        for (q, bucket) in buckets.into_iter().enumerate() {
            self.nodes.push(Node { bounds: quadrants[q], children: None, points: bucket });
        }
        self.nodes[node_idx].children = Some([
            first_child as u32,
            first_child as u32 + 1,
            first_child as u32 + 2,
            first_child as u32 + 3,
        ]);
        first_child
    }
}

fn point_bounds(x: &[f64], y: &[f64]) -> Rect {
    if x.is_empty() {
        return Rect::default();
    }
    let mut r = Rect { min_x: x[0], min_y: y[0], max_x: x[0], max_y: y[0] };
    for i in 1..x.len() {
        if x[i] < r.min_x {
            r.min_x = x[i];
        }
        if x[i] > r.max_x {
            r.max_x = x[i];
        }
        if y[i] < r.min_y {
            r.min_y = y[i];
        }
        if y[i] > r.max_y {
            r.max_y = y[i];
        }
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn brute_force(x: &[f64], y: &[f64], rect: &Rect) -> Vec<u32> {
        (0..x.len() as u32)
            .filter(|&i| rect.contains_point(x[i as usize], y[i as usize]))
            .collect()
    }

    #[test]
    fn matches_brute_force_on_random_points() {
        let mut rng = StdRng::seed_from_u64(0x9aD5);
        let n = 500;
        let x: Vec<f64> = (0..n).map(|_| rng.gen_range(-100.0..100.0)).collect();
        let y: Vec<f64> = (0..n).map(|_| rng.gen_range(-100.0..100.0)).collect();
        let tree = QuadTree::build(&x, &y);

        let mut out = Vec::new();
        for _ in 0..50 {
            let x0 = rng.gen_range(-120.0..100.0);
            let y0 = rng.gen_range(-120.0..100.0);
            let rect = Rect {
                min_x: x0,
                min_y: y0,
                max_x: x0 + rng.gen_range(0.0..60.0),
                max_y: y0 + rng.gen_range(0.0..60.0),
            };
            tree.query(&x, &y, &rect, &mut out);
            let mut got = out.clone();
            got.sort_unstable();
            assert_eq!(got, brute_force(&x, &y, &rect));
        }
    }

    #[test]
    fn empty_and_single_point_sets() {
        let tree = QuadTree::build(&[], &[]);
        let mut out = Vec::new();
        tree.query(&[], &[], &Rect { min_x: -1.0, min_y: -1.0, max_x: 1.0, max_y: 1.0 }, &mut out);
        assert!(out.is_empty());

        let (x, y) = (vec![3.0], vec![4.0]);
        let tree = QuadTree::build(&x, &y);
        tree.query(&x, &y, &Rect { min_x: 0.0, min_y: 0.0, max_x: 5.0, max_y: 5.0 }, &mut out);
        assert_eq!(out, vec![0]);
        tree.query(&x, &y, &Rect { min_x: 5.0, min_y: 5.0, max_x: 9.0, max_y: 9.0 }, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn coincident_points_respect_the_depth_cap() {
        // More identical points than a leaf holds; the depth cap stops
        // the subdivision and all of them stay queryable.
        let n = 64;
        let x = vec![1.0; n];
        let y = vec![2.0; n];
        let tree = QuadTree::build(&x, &y);
        let mut out = Vec::new();
        tree.query(&x, &y, &Rect { min_x: 0.0, min_y: 0.0, max_x: 3.0, max_y: 3.0 }, &mut out);
        assert_eq!(out.len(), n);
    }

    #[test]
    fn query_buffer_is_cleared_between_calls() {
        let x = vec![0.0, 10.0];
        let y = vec![0.0, 10.0];
        let tree = QuadTree::build(&x, &y);
        let mut out = Vec::new();
        tree.query(&x, &y, &Rect { min_x: -1.0, min_y: -1.0, max_x: 1.0, max_y: 1.0 }, &mut out);
        assert_eq!(out, vec![0]);
        tree.query(&x, &y, &Rect { min_x: 9.0, min_y: 9.0, max_x: 11.0, max_y: 11.0 }, &mut out);
        assert_eq!(out, vec![1]);
    }
}
