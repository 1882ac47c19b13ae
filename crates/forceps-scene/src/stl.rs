//! STL model loading (ASCII and binary)

use forceps_core::mesh::{MeshError, TriangleMesh};
use nalgebra::Point3;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StlError {
    #[error("Failed to read STL file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid STL data: {0}")]
    Parse(String),
    #[error("STL model has no triangles")]
    Empty,
    #[error("Invalid mesh: {0}")]
    Mesh(#[from] MeshError),
}

/// Load an STL file, detecting ASCII or binary encoding
pub fn load_stl(path: &Path) -> Result<TriangleMesh, StlError> {
    let file = File::open(path)?;
    read_mesh(&mut BufReader::new(file))
}

/// Parse STL bytes, detecting ASCII or binary encoding
pub fn parse_stl(data: &[u8]) -> Result<TriangleMesh, StlError> {
    read_mesh(&mut Cursor::new(data))
}

fn read_mesh<R: Read + Seek>(reader: &mut R) -> Result<TriangleMesh, StlError> {
    let stl = stl_io::read_stl(reader).map_err(|e| StlError::Parse(e.to_string()))?;
    if stl.faces.is_empty() {
        return Err(StlError::Empty);
    }

    let vertices = stl
        .vertices
        .iter()
        .map(|v| Point3::new(f64::from(v[0]), f64::from(v[1]), f64::from(v[2])))
        .collect();

    let faces = stl
        .faces
        .iter()
        .map(|face| {
            let mut indices = [0u32; 3];
            for (dst, src) in indices.iter_mut().zip(face.vertices) {
                *dst = u32::try_from(src)
                    .map_err(|_| StlError::Parse(format!("vertex index {} out of range", src)))?;
            }
            Ok(indices)
        })
        .collect::<Result<Vec<_>, StlError>>()?;

    Ok(TriangleMesh::new(vertices, faces)?)
}
