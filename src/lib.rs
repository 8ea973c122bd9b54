//! Ray/scene intersection service for GPU-driven renderers.
//!
//! Callers register triangular meshes into bottom-level structures
//! ([`Blas`]), optionally instance them through top-level structures
//! ([`tlas::Tlas`]), and dispatch batched closest-hit or occlusion
//! queries. Geometry is compiled into one of two node layouts: a binned
//! surface-area-heuristic BVH with 32-byte nodes, or a compressed 8-wide
//! BVH with per-node quantized child bounds. Traversal runs either on the
//! CPU or on the caller's GPU via a GLSL ES accessor module emitted at
//! runtime, against byte arrays the scene uploads through a [`Backend`]
//! capability.
//!
//! ```no_run
//! use rayforge::{BackendKind, Context, Ray};
//! use glam::Vec3;
//!
//! # fn main() -> rayforge::Result<()> {
//! let mut ctx = Context::init(BackendKind::Cpu);
//! let blas = ctx.create_ads(&[])?;
//! ctx.add_shape(blas, &rayforge::ShapeDesc {
//!     positions: &[-1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
//!     position_stride: 3,
//!     normals: None,
//!     normal_stride: 0,
//!     uvs: None,
//!     uv_stride: 0,
//!     num_vertices: 3,
//!     indices: &[0, 1, 2, 0],
//!     num_triangles: 1,
//! })?;
//! ctx.update()?;
//! let hit = ctx.intersect(blas, Ray::new(Vec3::new(0.0, 0.25, -1.0), Vec3::Z, 10.0))?;
//! assert!(hit.is_valid());
//! # Ok(())
//! # }
//! ```

pub mod accessor;
pub mod backend;
pub mod blas;
pub mod bounds;
pub mod bvh;
pub mod context;
pub mod error;
pub mod ray;
pub mod scene;
pub mod tlas;
pub mod traverse;
pub mod wide;

pub use backend::{
    Backend, BackendKind, Binding, BindingData, BindingKind, BufferInfo, TextureDesc,
    TextureFormat,
};
pub use blas::{Blas, BlasKind, ShapeDesc};
pub use bounds::Aabb;
pub use context::{Context, RayBuffers, version, version_string};
pub use error::{Error, Result};
pub use ray::Ray;
pub use scene::{
    AdsHandle, MAX_BLAS_COUNT, MAX_TLAS_COUNT, Scene, TLAS_ID_MASK, UpdateFlags,
};
pub use tlas::{Instance, Tlas};
pub use traverse::{Hit, Intersection};
