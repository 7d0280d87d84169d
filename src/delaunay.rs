//! Delaunay triangulation with per-facet barycentric coefficients and a
//! directed facet walk.
//!
//! The triangulation is built once per context by incremental insertion
//! (Bowyer–Watson) under an enclosing super-triangle. Facets live in a
//! flat arena; each stores its three vertex indices, its three neighbor
//! facets (`NO_NEIGHBOR` along the convex hull) and the precomputed
//! 2×2 affine map from Cartesian to barycentric coordinates, so that a
//! query costs two multiply-adds per weight.
//!
//! Point location is a directed walk: from a hint facet, cross the edge
//! opposite the most negative barycentric weight until every weight is
//! non-negative. Crossing a hull edge means the query is outside the
//! triangulation. Because the grid driver scans cells in row order and
//! each worker carries its own hint, the walk is O(1) per cell in
//! practice.

use std::collections::HashMap;

/// Sentinel for a facet edge on the convex hull.
pub const NO_NEIGHBOR: i32 = -1;

/// Weights down to this value still count as inside; absorbs rounding
/// noise for queries on facet edges.
const INSIDE_EPS: f64 = -1e-11;

/// Errors surfaced when building a triangulation.
#[derive(Debug, thiserror::Error)]
pub enum TriangulationError {
    #[error("degenerate point set: fewer than 3 distinct points or all points collinear")]
    Degenerate,
}

/// Precomputed affine map from Cartesian offsets (relative to the third
/// vertex) to the first two barycentric weights.
#[derive(Copy, Clone, Debug, Default)]
struct BaryCoeffs {
    m11: f64,
    m12: f64,
    m21: f64,
    m22: f64,
    ref_x: f64,
    ref_y: f64,
}

/// One triangle of the triangulation.
#[derive(Clone, Debug)]
pub struct Facet {
    /// Indices into the caller's point arrays, counter-clockwise.
    pub vertices: [u32; 3],
    /// `neighbors[k]` shares the edge opposite `vertices[k]`.
    pub neighbors: [i32; 3],
    coeffs: BaryCoeffs,
}

/// An immutable Delaunay index over a point set.
#[derive(Debug)]
pub struct Delaunay {
    facets: Vec<Facet>,
}

impl Delaunay {
    /// Triangulate the point set. Exact duplicate coordinates are
    /// collapsed onto their first occurrence.
    pub fn build(x: &[f64], y: &[f64]) -> Result<Self, TriangulationError> {
        debug_assert_eq!(x.len(), y.len());
        let n = x.len();
        if n < 3 {
            return Err(TriangulationError::Degenerate);
        }

        let mut builder = Builder::new(x, y);
        let mut seen: HashMap<(u64, u64), u32> = HashMap::with_capacity(n);
        for i in 0..n {
            let key = (x[i].to_bits(), y[i].to_bits());
            if seen.contains_key(&key) {
                continue;
            }
            seen.insert(key, i as u32);
            builder.insert(i as u32);
        }

        let facets = builder.finish()?;
        Ok(Self { facets })
    }

    /// Number of facets.
    pub fn facet_count(&self) -> usize {
        self.facets.len()
    }

    /// Vertex indices of a facet.
    #[inline]
    pub fn vertices(&self, facet: usize) -> [u32; 3] {
        self.facets[facet].vertices
    }

    /// Barycentric weights of `(qx, qy)` relative to `facet`, in vertex
    /// order. The weights always sum to 1; one or more are negative when
    /// the query lies outside the facet.
    #[inline]
    pub fn barycentric(&self, facet: usize, qx: f64, qy: f64) -> (f64, f64, f64) {
        let c = &self.facets[facet].coeffs;
        let dx = qx - c.ref_x;
        let dy = qy - c.ref_y;
        let l1 = c.m11 * dx + c.m12 * dy;
        let l2 = c.m21 * dx + c.m22 * dy;
        (l1, l2, 1.0 - l1 - l2)
    }

    /// Walk from `hint` to the facet containing `(qx, qy)`.
    ///
    /// Returns `(facet, true)` on success. When the query lies outside
    /// the convex hull the walk stops at a hull facet and returns it
    /// with `false`; reusing that facet as the next hint keeps
    /// subsequent walks short.
    pub fn locate(&self, hint: usize, qx: f64, qy: f64) -> (usize, bool) {
        let mut cur = if hint < self.facets.len() { hint } else { 0 };
        let mut steps = 0usize;
        loop {
            let (l1, l2, l3) = self.barycentric(cur, qx, qy);
            if l1 >= INSIDE_EPS && l2 >= INSIDE_EPS && l3 >= INSIDE_EPS {
                return (cur, true);
            }
            let lambdas = [l1, l2, l3];
            let mut worst = 0;
            for k in 1..3 {
                if lambdas[k] < lambdas[worst] {
                    worst = k;
                }
            }
            let next = self.facets[cur].neighbors[worst];
            if next == NO_NEIGHBOR {
                return (cur, false);
            }
            cur = next as usize;

            steps += 1;
            if steps > self.facets.len() {
                // Walk cycled on near-degenerate geometry; settle it
                // with an exhaustive containment scan.
                for f in 0..self.facets.len() {
                    let (l1, l2, l3) = self.barycentric(f, qx, qy);
                    if l1 >= INSIDE_EPS && l2 >= INSIDE_EPS && l3 >= INSIDE_EPS {
                        return (f, true);
                    }
                }
                return (cur, false);
            }
        }
    }
}

/// Triangle state during incremental construction.
#[derive(Clone)]
struct BuildTri {
    vertices: [u32; 3],
    neighbors: [i32; 3],
    alive: bool,
}

struct Builder<'a> {
    x: &'a [f64],
    y: &'a [f64],
    /// Coordinates of the three enclosing super-vertices, indexed
    /// `n_points..n_points + 3`.
    super_pts: [(f64, f64); 3],
    tris: Vec<BuildTri>,
    /// A recently created triangle, used as the walk start.
    last_alive: usize,
}

impl<'a> Builder<'a> {
    fn new(x: &'a [f64], y: &'a [f64]) -> Self {
        let mut min_x = x[0];
        let mut max_x = x[0];
        let mut min_y = y[0];
        let mut max_y = y[0];
        for i in 1..x.len() {
            min_x = min_x.min(x[i]);
            max_x = max_x.max(x[i]);
            min_y = min_y.min(y[i]);
            max_y = max_y.max(y[i]);
        }
        let cx = 0.5 * (min_x + max_x);
        let cy = 0.5 * (min_y + max_y);
        let d = (max_x - min_x).max(max_y - min_y).max(1.0);

        // Counter-clockwise super-triangle generously enclosing the
        // bounding box; every real point is strictly interior.
        let super_pts =
            [(cx - 20.0 * d, cy - 10.0 * d), (cx + 20.0 * d, cy - 10.0 * d), (cx, cy + 20.0 * d)];
        let n = x.len() as u32;
        let tris = vec![BuildTri {
            vertices: [n, n + 1, n + 2],
            neighbors: [NO_NEIGHBOR; 3],
            alive: true,
        }];
        Self { x, y, super_pts, tris, last_alive: 0 }
    }

    #[inline]
    fn coord(&self, v: u32) -> (f64, f64) {
        let n = self.x.len() as u32;
        if v < n {
            (self.x[v as usize], self.y[v as usize])
        } else {
            self.super_pts[(v - n) as usize]
        }
    }

    fn orient(&self, a: u32, b: u32, px: f64, py: f64) -> f64 {
        let (ax, ay) = self.coord(a);
        let (bx, by) = self.coord(b);
        (bx - ax) * (py - ay) - (by - ay) * (px - ax)
    }

    /// Strict circumcircle containment for a counter-clockwise triangle.
    fn in_circumcircle(&self, t: usize, px: f64, py: f64) -> bool {
        let [va, vb, vc] = self.tris[t].vertices;
        let (ax, ay) = self.coord(va);
        let (bx, by) = self.coord(vb);
        let (cx, cy) = self.coord(vc);
        let adx = ax - px;
        let ady = ay - py;
        let bdx = bx - px;
        let bdy = by - py;
        let cdx = cx - px;
        let cdy = cy - py;
        let det = (adx * adx + ady * ady) * (bdx * cdy - cdx * bdy)
            - (bdx * bdx + bdy * bdy) * (adx * cdy - cdx * ady)
            + (cdx * cdx + cdy * cdy) * (adx * bdy - bdx * ady);
        det > 0.0
    }

    /// Walk to a triangle containing `(px, py)`. The super-triangle
    /// encloses every insertion point, so the walk cannot leave the
    /// mesh; a step guard falls back to scanning.
    fn locate_containing(&self, px: f64, py: f64) -> usize {
        let mut cur = self.last_alive;
        if !self.tris[cur].alive {
            cur = self.tris.iter().position(|t| t.alive).unwrap_or(0);
        }
        let mut steps = 0usize;
        'walk: loop {
            let [v0, v1, v2] = self.tris[cur].vertices;
            let edges = [(v1, v2), (v2, v0), (v0, v1)];
            for (k, &(a, b)) in edges.iter().enumerate() {
                if self.orient(a, b, px, py) < 0.0 {
                    let next = self.tris[cur].neighbors[k];
                    if next != NO_NEIGHBOR {
                        cur = next as usize;
                        steps += 1;
                        if steps > 4 * self.tris.len() {
                            break 'walk;
                        }
                        continue 'walk;
                    }
                }
            }
            return cur;
        }
        // Numerical corner case: any triangle whose circumcircle
        // contains the point is a valid cavity seed.
        for t in 0..self.tris.len() {
            if self.tris[t].alive && self.in_circumcircle(t, px, py) {
                return t;
            }
        }
        self.last_alive
    }

    fn insert(&mut self, p: u32) {
        let (px, py) = self.coord(p);
        let seed = self.locate_containing(px, py);

        // Cavity: the edge-connected set of triangles whose circumcircle
        // contains the new point.
        let mut cavity = Vec::new();
        let mut in_cavity = vec![false; self.tris.len()];
        let mut stack = vec![seed];
        in_cavity[seed] = true;
        while let Some(t) = stack.pop() {
            cavity.push(t);
            for &nb in &self.tris[t].neighbors {
                if nb == NO_NEIGHBOR {
                    continue;
                }
                let nb = nb as usize;
                if !in_cavity[nb] && self.tris[nb].alive && self.in_circumcircle(nb, px, py) {
                    in_cavity[nb] = true;
                    stack.push(nb);
                }
            }
        }

        // Boundary edges of the cavity, in old-triangle winding order,
        // with the surviving outer neighbor of each.
        let mut boundary: Vec<(u32, u32, i32)> = Vec::new();
        for &t in &cavity {
            let [v0, v1, v2] = self.tris[t].vertices;
            let edges = [(v1, v2), (v2, v0), (v0, v1)];
            for (k, &(a, b)) in edges.iter().enumerate() {
                let nb = self.tris[t].neighbors[k];
                if nb == NO_NEIGHBOR || !in_cavity[nb as usize] {
                    boundary.push((a, b, nb));
                }
            }
        }
        for &t in &cavity {
            self.tris[t].alive = false;
        }

        // Fan the new point to every boundary edge. Old triangles wind
        // counter-clockwise, so (a, b, p) does too.
        let first_new = self.tris.len();
        let mut by_first: HashMap<u32, usize> = HashMap::with_capacity(boundary.len());
        let mut by_second: HashMap<u32, usize> = HashMap::with_capacity(boundary.len());
        for (j, &(a, b, _)) in boundary.iter().enumerate() {
            by_first.insert(a, first_new + j);
            by_second.insert(b, first_new + j);
        }
        for &(a, b, outer) in &boundary {
            let t = self.tris.len();
            let across_bp = by_first.get(&b).copied().map(|i| i as i32).unwrap_or(NO_NEIGHBOR);
            let across_pa = by_second.get(&a).copied().map(|i| i as i32).unwrap_or(NO_NEIGHBOR);
            self.tris.push(BuildTri {
                vertices: [a, b, p],
                neighbors: [across_bp, across_pa, outer],
                alive: true,
            });
            if outer != NO_NEIGHBOR {
                // Repoint the survivor's edge (a, b) at the new triangle.
                let o = &mut self.tris[outer as usize];
                let [w0, w1, w2] = o.vertices;
                let oedges = [(w1, w2), (w2, w0), (w0, w1)];
                for (k, &(oa, ob)) in oedges.iter().enumerate() {
                    if (oa == b && ob == a) || (oa == a && ob == b) {
                        o.neighbors[k] = t as i32;
                    }
                }
            }
        }
        self.last_alive = first_new;
    }

    /// Drop super-triangle facets, compact the arena, and compute the
    /// barycentric coefficient cache.
    fn finish(self) -> Result<Vec<Facet>, TriangulationError> {
        let n = self.x.len() as u32;
        let mut remap = vec![NO_NEIGHBOR; self.tris.len()];
        let mut kept = Vec::new();
        for (t, tri) in self.tris.iter().enumerate() {
            // Zero-area slivers can arise from exactly cocircular or
            // collinear inputs; dropping one leaves a hull edge, which
            // the walk and the linear fallback already handle.
            if tri.alive && tri.vertices.iter().all(|&v| v < n) && self.facet_det(tri) != 0.0 {
                remap[t] = kept.len() as i32;
                kept.push(t);
            }
        }
        if kept.is_empty() {
            // All real points collinear: every triangle leans on a
            // super-vertex.
            return Err(TriangulationError::Degenerate);
        }

        let mut facets = Vec::with_capacity(kept.len());
        for &t in &kept {
            let tri = &self.tris[t];
            let neighbors = [
                resolve_neighbor(&remap, tri.neighbors[0]),
                resolve_neighbor(&remap, tri.neighbors[1]),
                resolve_neighbor(&remap, tri.neighbors[2]),
            ];
            let [v1, v2, v3] = tri.vertices;
            let (x1, y1) = self.coord(v1);
            let (x2, y2) = self.coord(v2);
            let (x3, y3) = self.coord(v3);
            let det = self.facet_det(tri);
            let coeffs = BaryCoeffs {
                m11: (y2 - y3) / det,
                m12: (x3 - x2) / det,
                m21: (y3 - y1) / det,
                m22: (x1 - x3) / det,
                ref_x: x3,
                ref_y: y3,
            };
            facets.push(Facet { vertices: tri.vertices, neighbors, coeffs });
        }
        Ok(facets)
    }

    /// Twice the signed facet area, the denominator of the barycentric
    /// coefficient map.
    fn facet_det(&self, tri: &BuildTri) -> f64 {
        let [v1, v2, v3] = tri.vertices;
        let (x1, y1) = self.coord(v1);
        let (x2, y2) = self.coord(v2);
        let (x3, y3) = self.coord(v3);
        (y2 - y3) * (x1 - x3) + (x3 - x2) * (y1 - y3)
    }
}

#[inline]
fn resolve_neighbor(remap: &[i32], nb: i32) -> i32 {
    if nb == NO_NEIGHBOR {
        NO_NEIGHBOR
    } else {
        remap[nb as usize]
    }
}
