//! Triangulated anatomical surfaces and nearest-surface queries

use nalgebra::{Point3, Vector3};
use thiserror::Error;

use crate::pose::Pose;

/// Triangles with a cross product norm below this are treated as degenerate
const DEGENERATE_AREA: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    #[error("Face {face} references vertex {index}, but mesh has {count} vertices")]
    IndexOutOfBounds { face: usize, index: u32, count: usize },
    #[error("Mesh contains non-finite vertex at index {0}")]
    NonFiniteVertex(usize),
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Aabb {
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point3<f64>>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = *iter.next()?;
        let mut bounds = Aabb {
            min: first,
            max: first,
        };
        for p in iter {
            bounds.min = bounds.min.inf(p);
            bounds.max = bounds.max.sup(p);
        }
        Some(bounds)
    }

    /// Grow the box by `margin` on every side
    pub fn expanded(&self, margin: f64) -> Self {
        let m = Vector3::repeat(margin);
        Aabb {
            min: self.min - m,
            max: self.max + m,
        }
    }

    pub fn contains(&self, p: &Point3<f64>) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }
}

/// Indexed triangle mesh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriangleMesh {
    vertices: Vec<Point3<f64>>,
    faces: Vec<[u32; 3]>,
}

impl TriangleMesh {
    /// Create a mesh, validating that every face index is in bounds
    pub fn new(vertices: Vec<Point3<f64>>, faces: Vec<[u32; 3]>) -> Result<Self, MeshError> {
        if let Some(i) = vertices
            .iter()
            .position(|v| !v.coords.iter().all(|c| c.is_finite()))
        {
            return Err(MeshError::NonFiniteVertex(i));
        }

        for (face_idx, face) in faces.iter().enumerate() {
            for &index in face {
                if index as usize >= vertices.len() {
                    return Err(MeshError::IndexOutOfBounds {
                        face: face_idx,
                        index,
                        count: vertices.len(),
                    });
                }
            }
        }

        Ok(Self { vertices, faces })
    }

    /// Build from a triangle soup (three vertices per triangle, no sharing)
    pub fn from_triangles(triangles: impl IntoIterator<Item = [Point3<f64>; 3]>) -> Result<Self, MeshError> {
        let mut vertices = Vec::new();
        let mut faces = Vec::new();
        for tri in triangles {
            let base = vertices.len() as u32;
            vertices.extend_from_slice(&tri);
            faces.push([base, base + 1, base + 2]);
        }
        Self::new(vertices, faces)
    }

    /// Flat disc made of `segments` triangles fanned around `center`
    ///
    /// Useful for synthetic anatomy in exercises and tests.
    pub fn disc(center: Point3<f64>, normal: Vector3<f64>, radius: f64, segments: u32) -> Self {
        let n = normal.try_normalize(f64::EPSILON).unwrap_or_else(Vector3::z);
        // Any vector not parallel to n gives a basis for the disc plane
        let helper = if n.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
        let u = n.cross(&helper).normalize();
        let v = n.cross(&u);

        let segments = segments.max(3);
        let mut vertices = vec![center];
        for i in 0..segments {
            let theta = (i as f64) * 2.0 * std::f64::consts::PI / (segments as f64);
            vertices.push(center + (u * theta.cos() + v * theta.sin()) * radius);
        }

        let faces = (0..segments)
            .map(|i| [0, i + 1, (i + 1) % segments + 1])
            .collect();

        Self { vertices, faces }
    }

    pub fn vertices(&self) -> &[Point3<f64>] {
        &self.vertices
    }

    pub fn faces(&self) -> &[[u32; 3]] {
        &self.faces
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Iterate triangles as vertex triples
    pub fn triangles(&self) -> impl Iterator<Item = [Point3<f64>; 3]> + '_ {
        self.faces.iter().map(move |f| {
            [
                self.vertices[f[0] as usize],
                self.vertices[f[1] as usize],
                self.vertices[f[2] as usize],
            ]
        })
    }

    /// Number of triangles with non-zero area
    pub fn valid_face_count(&self) -> usize {
        self.triangles().filter(|t| !is_degenerate(t)).count()
    }

    /// Bounding box of the referenced vertices
    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::from_points(self.faces.iter().flatten().map(|&i| &self.vertices[i as usize]))
    }

    /// Copy of this mesh with every vertex mapped through `pose`
    pub fn transformed(&self, pose: &Pose) -> TriangleMesh {
        TriangleMesh {
            vertices: self.vertices.iter().map(|v| pose.transform_point(v)).collect(),
            faces: self.faces.clone(),
        }
    }

    /// Closest point on the surface and its distance to `point`
    ///
    /// Degenerate triangles are skipped. Returns `None` if no valid triangle
    /// remains.
    pub fn closest_point(&self, point: &Point3<f64>) -> Option<(Point3<f64>, f64)> {
        let mut best: Option<(Point3<f64>, f64)> = None;

        for tri in self.triangles() {
            if is_degenerate(&tri) {
                continue;
            }
            let p = closest_point_on_triangle(point, &tri[0], &tri[1], &tri[2]);
            let dist_sq = (p - point).norm_squared();
            if best.map_or(true, |(_, d)| dist_sq < d) {
                best = Some((p, dist_sq));
            }
        }

        best.map(|(p, d)| (p, d.sqrt()))
    }
}

fn is_degenerate(tri: &[Point3<f64>; 3]) -> bool {
    (tri[1] - tri[0]).cross(&(tri[2] - tri[0])).norm() < DEGENERATE_AREA
}

/// Closest point on triangle `abc` to `p`
///
/// Voronoi-region walk from "Real-Time Collision Detection" (Ericson).
pub fn closest_point_on_triangle(
    p: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
) -> Point3<f64> {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return *a;
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return *b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return *c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    // Inside the face
    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_triangle() -> [Point3<f64>; 3] {
        [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ]
    }

    #[test]
    fn test_closest_point_regions() {
        let [a, b, c] = unit_triangle();

        // Above the face
        let p = closest_point_on_triangle(&Point3::new(0.25, 0.25, 3.0), &a, &b, &c);
        assert_relative_eq!(p, Point3::new(0.25, 0.25, 0.0));

        // Beyond vertex A
        let p = closest_point_on_triangle(&Point3::new(-1.0, -1.0, 0.0), &a, &b, &c);
        assert_relative_eq!(p, a);

        // Beyond edge BC
        let p = closest_point_on_triangle(&Point3::new(1.0, 1.0, 0.0), &a, &b, &c);
        assert_relative_eq!(p, Point3::new(0.5, 0.5, 0.0));
    }

    #[test]
    fn test_new_rejects_bad_index() {
        let err = TriangleMesh::new(unit_triangle().to_vec(), vec![[0, 1, 3]]).unwrap_err();
        assert_eq!(
            err,
            MeshError::IndexOutOfBounds {
                face: 0,
                index: 3,
                count: 3
            }
        );
    }

    #[test]
    fn test_degenerate_faces_are_skipped() {
        let collapsed = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ];
        let mesh = TriangleMesh::from_triangles([collapsed]).unwrap();
        assert_eq!(mesh.face_count(), 1);
        assert_eq!(mesh.valid_face_count(), 0);
        assert!(mesh.closest_point(&Point3::origin()).is_none());
    }

    #[test]
    fn test_disc_geometry() {
        let disc = TriangleMesh::disc(Point3::new(0.0, 0.0, 30.0), Vector3::z(), 5.0, 16);
        assert_eq!(disc.face_count(), 16);

        let bounds = disc.bounds().unwrap();
        assert_relative_eq!(bounds.min.z, 30.0, epsilon = 1e-9);
        assert_relative_eq!(bounds.max.x, 5.0, epsilon = 1e-9);

        let (closest, dist) = disc.closest_point(&Point3::new(1.0, 1.0, 40.0)).unwrap();
        assert_relative_eq!(dist, 10.0, epsilon = 1e-9);
        assert_relative_eq!(closest, Point3::new(1.0, 1.0, 30.0), epsilon = 1e-9);
    }

    #[test]
    fn test_transformed_moves_vertices() {
        let mesh = TriangleMesh::from_triangles([unit_triangle()]).unwrap();
        let moved = mesh.transformed(&Pose::from_translation(0.0, 0.0, 5.0));
        let (_, dist) = moved.closest_point(&Point3::origin()).unwrap();
        assert_relative_eq!(dist, 5.0);
    }
}
