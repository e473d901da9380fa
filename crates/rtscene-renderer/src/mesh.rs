//! Mesh import: OBJ files to deduplicated, scaled vertex/index arrays.

use glam::Vec3;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{RenderError, RenderResult};

/// Vertex record shared with the closest-hit shader (24 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

/// Triangle mesh ready for upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }
}

/// Source of mesh data for scene objects.
pub trait MeshSource {
    /// Load `path` with positions multiplied by `scale`.
    fn load(&self, path: &Path, scale: Vec3) -> RenderResult<MeshData>;
}

/// Wavefront OBJ loader backed by `tobj`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ObjLoader;

impl MeshSource for ObjLoader {
    fn load(&self, path: &Path, scale: Vec3) -> RenderResult<MeshData> {
        let options = tobj::LoadOptions {
            triangulate: true,
            single_index: false,
            ignore_points: true,
            ignore_lines: true,
            ..Default::default()
        };

        let (models, _materials) = tobj::load_obj(path, &options)
            .map_err(|e| RenderError::MeshImport {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut builder = MeshBuilder::default();
        for model in &models {
            let mesh = &model.mesh;
            let normal_indices = (!mesh.normal_indices.is_empty()).then_some(mesh.normal_indices.as_slice());
            builder.add(&mesh.positions, &mesh.normals, &mesh.indices, normal_indices, scale);
        }

        if builder.indices.is_empty() {
            return Err(RenderError::MeshImport {
                path: path.to_path_buf(),
                reason: "file contains no triangles".into(),
            });
        }

        let (mesh, filled) = builder.finish();
        log::debug!(
            "Loaded {}: {} vertices, {} triangles, {} normals computed",
            path.display(),
            mesh.vertices.len(),
            mesh.triangle_count(),
            filled
        );
        Ok(mesh)
    }
}

/// Accumulates OBJ models into one welded mesh.
///
/// Vertices are keyed by their (position index, normal index) pair, so faces
/// without normals share a vertex per position and get smooth normals. Any
/// vertex left without a usable normal gets one computed from its faces.
#[derive(Default)]
struct MeshBuilder {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    unique: HashMap<(usize, u32, Option<u32>), u32>,
    model: usize,
}

impl MeshBuilder {
    fn add(
        &mut self,
        positions: &[f32],
        normals: &[f32],
        position_indices: &[u32],
        normal_indices: Option<&[u32]>,
        scale: Vec3,
    ) {
        for (corner, &pi) in position_indices.iter().enumerate() {
            let ni = normal_indices.and_then(|n| n.get(corner).copied());
            let key = (self.model, pi, ni);

            let index = match self.unique.get(&key) {
                Some(&index) => index,
                None => {
                    let p = pi as usize * 3;
                    let position = Vec3::new(positions[p], positions[p + 1], positions[p + 2]) * scale;
                    let n = ni.map(|ni| ni as usize * 3);
                    let normal = match n.and_then(|n| normals.get(n..n + 3)) {
                        Some(&[x, y, z]) => [x, y, z],
                        _ => [0.0; 3],
                    };
                    let index = self.vertices.len() as u32;
                    self.vertices.push(Vertex { position: position.to_array(), normal });
                    self.unique.insert(key, index);
                    index
                }
            };
            self.indices.push(index);
        }
        self.model += 1;
    }

    /// The welded mesh and how many normals had to be computed.
    fn finish(mut self) -> (MeshData, usize) {
        let filled = fill_missing_normals(&mut self.vertices, &self.indices);
        let mesh = MeshData {
            vertices: self.vertices,
            indices: self.indices,
        };
        (mesh, filled)
    }
}

/// Replace every vertex normal with the normalized sum of the (unnormalized)
/// cross products of its adjacent faces, or +Y when that sum is zero.
pub fn synthesize_normals(vertices: &mut [Vertex], indices: &[u32]) {
    let accumulated = face_normal_sums(vertices, indices);
    for (vertex, sum) in vertices.iter_mut().zip(accumulated) {
        vertex.normal = smooth_normal(sum);
    }
}

/// Like [`synthesize_normals`], but only for vertices whose normal is zero or
/// not finite. Returns how many were replaced.
pub fn fill_missing_normals(vertices: &mut [Vertex], indices: &[u32]) -> usize {
    let missing = |v: &Vertex| {
        let n = Vec3::from(v.normal);
        !n.is_finite() || n.length_squared() == 0.0
    };
    if !vertices.iter().any(missing) {
        return 0;
    }

    let accumulated = face_normal_sums(vertices, indices);
    let mut filled = 0;
    for (vertex, sum) in vertices.iter_mut().zip(accumulated) {
        if missing(&*vertex) {
            vertex.normal = smooth_normal(sum);
            filled += 1;
        }
    }
    filled
}

fn smooth_normal(sum: Vec3) -> [f32; 3] {
    let normal = if sum.length_squared() > 0.0 { sum.normalize() } else { Vec3::Y };
    normal.to_array()
}

fn face_normal_sums(vertices: &[Vertex], indices: &[u32]) -> Vec<Vec3> {
    let mut accumulated = vec![Vec3::ZERO; vertices.len()];

    for tri in indices.chunks_exact(3) {
        let [i0, i1, i2] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        let v0 = Vec3::from(vertices[i0].position);
        let v1 = Vec3::from(vertices[i1].position);
        let v2 = Vec3::from(vertices[i2].position);

        let face = (v1 - v0).cross(v2 - v0);
        accumulated[i0] += face;
        accumulated[i1] += face;
        accumulated[i2] += face;
    }
    accumulated
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vertex(x: f32, y: f32, z: f32) -> Vertex {
        Vertex { position: [x, y, z], normal: [0.0; 3] }
    }

    fn assert_vec_eq(actual: [f32; 3], expected: Vec3) {
        assert!(
            Vec3::from(actual).abs_diff_eq(expected, 1e-5),
            "expected {:?}, got {:?}", expected, actual
        );
    }

    // ============================================================
    // Normal synthesis
    // ============================================================

    #[test]
    fn test_single_triangle_normal() {
        let mut vertices = vec![vertex(0.0, 0.0, 0.0), vertex(1.0, 0.0, 0.0), vertex(0.0, 1.0, 0.0)];
        synthesize_normals(&mut vertices, &[0, 1, 2]);
        for v in &vertices {
            assert_vec_eq(v.normal, Vec3::Z);
        }
    }

    #[test]
    fn test_shared_vertex_averages_weighted_faces() {
        // Two faces meeting at a 90 degree edge: one in the XY plane (area 0.5),
        // one in the XZ plane with twice the area.
        let mut vertices = vec![
            vertex(0.0, 0.0, 0.0),
            vertex(1.0, 0.0, 0.0),
            vertex(0.0, 1.0, 0.0),
            vertex(0.0, 0.0, 2.0),
        ];
        let indices = [0, 1, 2, 0, 3, 1];
        synthesize_normals(&mut vertices, &indices);

        let face_a = Vec3::new(1.0, 0.0, 0.0).cross(Vec3::new(0.0, 1.0, 0.0));
        let face_b = Vec3::new(0.0, 0.0, 2.0).cross(Vec3::new(1.0, 0.0, 0.0));
        assert_vec_eq(vertices[0].normal, (face_a + face_b).normalize());
        assert_vec_eq(vertices[2].normal, face_a.normalize());
        assert_vec_eq(vertices[3].normal, face_b.normalize());
    }

    #[test]
    fn test_normals_are_unit_length() {
        let mut vertices = vec![vertex(0.0, 0.0, 0.0), vertex(3.0, 0.0, 0.0), vertex(0.0, 0.0, -7.0)];
        synthesize_normals(&mut vertices, &[0, 1, 2]);
        for v in &vertices {
            assert!((Vec3::from(v.normal).length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_degenerate_face_defaults_to_up() {
        let mut vertices = vec![vertex(0.0, 0.0, 0.0), vertex(1.0, 0.0, 0.0), vertex(2.0, 0.0, 0.0)];
        synthesize_normals(&mut vertices, &[0, 1, 2]);
        for v in &vertices {
            assert_vec_eq(v.normal, Vec3::Y);
        }
    }

    #[test]
    fn test_unreferenced_vertex_defaults_to_up() {
        let mut vertices = vec![
            vertex(0.0, 0.0, 0.0),
            vertex(1.0, 0.0, 0.0),
            vertex(0.0, 1.0, 0.0),
            vertex(5.0, 5.0, 5.0),
        ];
        synthesize_normals(&mut vertices, &[0, 1, 2]);
        assert_vec_eq(vertices[3].normal, Vec3::Y);
    }

    #[test]
    fn test_opposing_faces_cancel_to_up() {
        let mut vertices = vec![vertex(0.0, 0.0, 0.0), vertex(1.0, 0.0, 0.0), vertex(0.0, 1.0, 0.0)];
        synthesize_normals(&mut vertices, &[0, 1, 2, 0, 2, 1]);
        assert_vec_eq(vertices[0].normal, Vec3::Y);
    }

    #[test]
    fn test_fill_keeps_authored_normals() {
        let mut vertices = vec![vertex(0.0, 0.0, 0.0), vertex(1.0, 0.0, 0.0), vertex(0.0, 1.0, 0.0)];
        vertices[0].normal = [0.0, 0.0, -1.0];
        vertices[1].normal = [1.0, 0.0, 0.0];

        let filled = fill_missing_normals(&mut vertices, &[0, 1, 2]);
        assert_eq!(filled, 1);
        assert_vec_eq(vertices[0].normal, Vec3::NEG_Z);
        assert_vec_eq(vertices[1].normal, Vec3::X);
        assert_vec_eq(vertices[2].normal, Vec3::Z);
    }

    #[test]
    fn test_fill_replaces_non_finite_normals() {
        let mut vertices = vec![vertex(0.0, 0.0, 0.0), vertex(1.0, 0.0, 0.0), vertex(0.0, 1.0, 0.0)];
        for v in &mut vertices {
            v.normal = [0.0, 1.0, 0.0];
        }
        vertices[2].normal = [f32::NAN, 0.0, 0.0];

        assert_eq!(fill_missing_normals(&mut vertices, &[0, 1, 2]), 1);
        assert_vec_eq(vertices[0].normal, Vec3::Y);
        assert_vec_eq(vertices[2].normal, Vec3::Z);
    }

    #[test]
    fn test_fill_is_noop_when_complete() {
        let mut vertices = vec![vertex(0.0, 0.0, 0.0), vertex(1.0, 0.0, 0.0), vertex(0.0, 1.0, 0.0)];
        for v in &mut vertices {
            v.normal = [0.0, 1.0, 0.0];
        }
        assert_eq!(fill_missing_normals(&mut vertices, &[0, 1, 2]), 0);
        assert!(vertices.iter().all(|v| v.normal == [0.0, 1.0, 0.0]));
    }

    // ============================================================
    // OBJ import
    // ============================================================

    fn write_obj(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".obj").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_vertex_is_24_bytes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
    }

    #[test]
    fn test_load_quad_without_normals_welds_and_scales() {
        let file = write_obj(
            "v 0 0 0\nv 1 0 0\nv 1 0 -1\nv 0 0 -1\nf 1 2 3\nf 1 3 4\n",
        );
        let mesh = ObjLoader.load(file.path(), Vec3::new(2.0, 1.0, 3.0)).unwrap();

        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        assert_eq!(mesh.triangle_count(), 2);
        assert_vec_eq(mesh.vertices[1].position, Vec3::new(2.0, 0.0, 0.0));
        assert_vec_eq(mesh.vertices[2].position, Vec3::new(2.0, 0.0, -3.0));
        for v in &mesh.vertices {
            assert_vec_eq(v.normal, Vec3::Y);
        }
    }

    #[test]
    fn test_load_keeps_authored_normals() {
        let file = write_obj(
            "v 0 0 0\nv 1 0 0\nv 0 1 0\nvn 0 0 -1\nf 1//1 2//1 3//1\n",
        );
        let mesh = ObjLoader.load(file.path(), Vec3::ONE).unwrap();
        assert_eq!(mesh.vertices.len(), 3);
        for v in &mesh.vertices {
            assert_vec_eq(v.normal, Vec3::NEG_Z);
        }
    }

    #[test]
    fn test_load_mixed_faces_has_no_zero_normals() {
        let file = write_obj(
            "v 0 0 0\nv 1 0 0\nv 0 1 0\nv 1 1 0\nvn 0 0 1\nf 1//1 2//1 3//1\nf 2 4 3\n",
        );
        let mesh = ObjLoader.load(file.path(), Vec3::ONE).unwrap();
        assert_eq!(mesh.triangle_count(), 2);
        for v in &mesh.vertices {
            let n = Vec3::from(v.normal);
            assert!(n.is_finite());
            assert!((n.length() - 1.0).abs() < 1e-5, "normal {:?} is not unit length", v.normal);
        }
    }

    #[test]
    fn test_load_triangulates_polygons() {
        let file = write_obj("v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nf 1 2 3 4\n");
        let mesh = ObjLoader.load(file.path(), Vec3::ONE).unwrap();
        assert_eq!(mesh.triangle_count(), 2);
    }

    #[test]
    fn test_missing_file_is_import_error() {
        let err = ObjLoader.load(Path::new("does/not/exist.obj"), Vec3::ONE).unwrap_err();
        assert!(matches!(err, RenderError::MeshImport { .. }));
    }

    #[test]
    fn test_empty_mesh_is_import_error() {
        let file = write_obj("v 0 0 0\n");
        let err = ObjLoader.load(file.path(), Vec3::ONE).unwrap_err();
        assert!(matches!(err, RenderError::MeshImport { .. }));
    }
}
