use glam::Vec3;
use rayon::prelude::*;

use crate::accessor::{self, AccessorParams};
use crate::backend::{
    Backend, BackendKind, Binding, BufferInfo, CpuBackend, NullBackend, TextureDesc,
    TextureFormat, Tiling, tile_instances, tile_pixels,
};
use crate::blas::{BlasKind, ShapeDesc};
use crate::error::{Error, Result};
use crate::ray::Ray;
use crate::scene::{AdsHandle, MAX_TLAS_COUNT, Scene, UpdateFlags};
use crate::traverse::{self, Intersection};

/// Texels one node record occupies in the node texture.
fn node_texel_stride(kind: BlasKind) -> usize {
    match kind {
        BlasKind::Sah => 2,  // 32 bytes
        BlasKind::Wide => 5, // 80 bytes
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct TextureSizes {
    vertex: Tiling,
    index: Tiling,
    node: Tiling,
    instance: Tiling,
}

/// Owner of one scene, its backend capability, and the artifacts of the
/// last update (accessor text, binding table).
///
/// Mutations record work in the scene's update flags;
/// [`Context::update`] services and returns them. Queries are read-only
/// once `update` has returned.
pub struct Context {
    scene: Scene,
    backend: Box<dyn Backend>,
    accessor: String,
    bindings: Vec<Binding>,
    sizes: TextureSizes,
}

impl Context {
    /// Creates a context with the built-in backend for `kind`: an
    /// in-memory store for `Cpu`, a no-op uploader otherwise. GPU-driver
    /// backed uploads come in through [`Context::with_backend`].
    pub fn init(kind: BackendKind) -> Context {
        let backend: Box<dyn Backend> = match kind {
            BackendKind::Cpu => Box::new(CpuBackend),
            other => Box::new(NullBackend { kind: other }),
        };
        Context::with_backend(backend)
    }

    pub fn with_backend(backend: Box<dyn Backend>) -> Context {
        Context {
            scene: Scene::new(BlasKind::default()),
            backend,
            accessor: String::new(),
            bindings: Vec::new(),
            sizes: TextureSizes::default(),
        }
    }

    /// Selects the scene-wide node layout. Call before creating any ADS;
    /// structures already created keep the layout they were built with.
    pub fn with_node_layout(mut self, kind: BlasKind) -> Context {
        self.scene.kind = kind;
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn create_ads(&mut self, descriptors: &[(&str, &str)]) -> Result<AdsHandle> {
        self.scene.create_ads(descriptors)
    }

    pub fn add_shape(&mut self, ads: AdsHandle, desc: &ShapeDesc) -> Result<u32> {
        self.scene.add_shape(ads, desc)
    }

    pub fn add_instance(
        &mut self,
        tlas: AdsHandle,
        blas: AdsHandle,
        transform: &[f32; 12],
    ) -> Result<u32> {
        self.scene.add_instance(tlas, blas, transform)
    }

    pub fn update_instance(
        &mut self,
        tlas: AdsHandle,
        instance_id: u32,
        transform: &[f32; 12],
    ) -> Result<()> {
        self.scene.update_instance(tlas, instance_id, transform)
    }

    /// Rebuilds every dirty BLAS, repacks instance data, refreshes the
    /// binding table and re-emits the accessor text. Returns the flags it
    /// serviced; a no-op when nothing changed since the last call.
    ///
    /// On failure the scene keeps its previous state, except for backend
    /// upload errors, which leave the affected structures marked unbuilt.
    pub fn update(&mut self) -> Result<UpdateFlags> {
        if !self.scene.needs_update && self.scene.update_flags.is_empty() {
            return Ok(UpdateFlags::empty());
        }
        let _span = tracing::debug_span!("scene_update").entered();

        // growing an instance list changes counts baked into the accessor
        if self.scene.update_flags.contains(UpdateFlags::INSTANCE_ADD) {
            self.scene.update_flags |=
                UpdateFlags::ACCESSOR_BINDINGS | UpdateFlags::ACCESSOR_CODE;
        }
        let serviced = self.scene.update_flags;

        if serviced
            .intersects(UpdateFlags::ACCESSOR_BINDINGS | UpdateFlags::ACCESSOR_CODE)
        {
            self.scene
                .blas
                .par_iter_mut()
                .try_for_each(|blas| blas.build())?;
        }

        self.rebuild_bindings()?;
        self.accessor = accessor::emit(&self.accessor_params());

        self.scene.update_flags = UpdateFlags::empty();
        self.scene.needs_update = false;
        tracing::debug!(?serviced, "scene update complete");
        Ok(serviced)
    }

    fn accessor_params(&self) -> AccessorParams {
        let mut tlas_instance_counts = [0usize; MAX_TLAS_COUNT];
        for (i, tlas) in self.scene.tlas.iter().enumerate() {
            tlas_instance_counts[i] = tlas.instances.len();
        }
        AccessorParams {
            kind: self.scene.kind,
            vertex_texture_size: self.sizes.vertex.size,
            index_texture_size: self.sizes.index.size,
            node_texture_size: self.sizes.node.size,
            instance_texture_size: self.sizes.instance.size,
            instance_count: self.scene.max_instances(),
            tlas_instance_counts,
            triangle_count: self.scene.max_triangle_count(),
            node_count: self.scene.max_node_count(),
        }
    }

    /// Re-tiles every array and pushes the bytes through the backend. On
    /// failure every BLAS is marked unbuilt so the next update re-uploads.
    fn rebuild_bindings(&mut self) -> Result<()> {
        self.bindings.clear();
        match self.upload_all() {
            Ok(bindings) => {
                self.bindings = bindings;
                Ok(())
            }
            Err(err) => {
                for blas in &mut self.scene.blas {
                    blas.needs_rebuild = true;
                }
                Err(err)
            }
        }
    }

    fn upload_all(&mut self) -> Result<Vec<Binding>> {
        let mut bindings = Vec::with_capacity(4);
        let blas_count = self.scene.blas.len();

        let mut vertex = tile_pixels(0);
        let mut index = tile_pixels(0);
        let mut node = tile_pixels(0);
        let stride = node_texel_stride(self.scene.kind);
        for blas in &self.scene.blas {
            vertex = max_tiling(vertex, tile_pixels(blas.vertices.len()));
            index = max_tiling(index, tile_pixels(blas.triangles.len()));
            node = max_tiling(node, tile_pixels(blas.total_nodes() * stride));
        }
        self.sizes.vertex = vertex;
        self.sizes.index = index;
        self.sizes.node = node;

        if blas_count > 0 {
            let vertex_layers: Vec<&[u8]> = self
                .scene
                .blas
                .iter()
                .flat_map(|b| [b.vertex_bytes(), b.normal_bytes()])
                .collect();
            let (kind, data) = self.backend.upload_texture_array(
                &TextureDesc {
                    label: "scene_vertices",
                    format: TextureFormat::Rgba32F,
                    width: vertex.width,
                    height: vertex.height,
                    layers: blas_count * 2,
                },
                &vertex_layers,
            )?;
            bindings.push(Binding {
                name: "scene_vertices",
                kind,
                data,
            });

            let index_layers: Vec<&[u8]> =
                self.scene.blas.iter().map(|b| b.index_bytes()).collect();
            let (kind, data) = self.backend.upload_texture_array(
                &TextureDesc {
                    label: "scene_indices",
                    format: TextureFormat::Rgba32I,
                    width: index.width,
                    height: index.height,
                    layers: blas_count,
                },
                &index_layers,
            )?;
            bindings.push(Binding {
                name: "scene_indices",
                kind,
                data,
            });

            let node_layers: Vec<&[u8]> =
                self.scene.blas.iter().map(|b| b.node_bytes()).collect();
            let (kind, data) = self.backend.upload_texture_array(
                &TextureDesc {
                    label: "bvh_nodes",
                    format: TextureFormat::Rgba32F,
                    width: node.width,
                    height: node.height,
                    layers: blas_count,
                },
                &node_layers,
            )?;
            bindings.push(Binding {
                name: "bvh_nodes",
                kind,
                data,
            });
        }

        let max_instances = self.scene.max_instances();
        self.sizes.instance = tile_instances(max_instances);
        if max_instances > 0 {
            let packed: Vec<Vec<u8>> = self
                .scene
                .tlas
                .iter()
                .map(|t| bytemuck::cast_slice(&t.packed(max_instances)).to_vec())
                .collect();
            let layers: Vec<&[u8]> = packed.iter().map(|p| p.as_slice()).collect();
            let (kind, data) = self.backend.upload_texture_array(
                &TextureDesc {
                    label: "scene_instances",
                    format: TextureFormat::Rgba32F,
                    width: self.sizes.instance.width,
                    height: self.sizes.instance.height,
                    layers: self.scene.tlas.len(),
                },
                &layers,
            )?;
            bindings.push(Binding {
                name: "scene_instances",
                kind,
                data,
            });
        }

        Ok(bindings)
    }

    /// The emitted accessor module. Empty before the first update. The
    /// text carries no `#version` or `precision` preamble; the including
    /// shader supplies those.
    pub fn scene_accessor(&self) -> &str {
        &self.accessor
    }

    pub fn scene_accessor_bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Single-ray closest hit on the CPU path.
    pub fn intersect(&self, ads: AdsHandle, ray: Ray) -> Result<Intersection> {
        traverse::intersect_scene(&self.scene, ads, ray)
    }

    /// Single-ray occlusion on the CPU path.
    pub fn occlude(&self, ads: AdsHandle, ray: Ray) -> Result<bool> {
        traverse::occlude_scene(&self.scene, ads, ray)
    }

    /// Batched closest-hit query over a 2-D ray buffer. Inactive rays
    /// (`direction.w == 0`) produce the miss record.
    pub fn query_intersection(
        &self,
        ads: AdsHandle,
        rays: &RayBuffers,
        out: &mut [[i32; 4]],
    ) -> Result<()> {
        let count = rays.validate(out.len())?;
        for i in 0..count {
            let d = rays.directions[i];
            if d[3] == 0.0 {
                out[i] = Intersection::miss(0.0).0;
                continue;
            }
            out[i] = traverse::intersect_scene(&self.scene, ads, rays.ray(i))?.0;
        }
        Ok(())
    }

    /// Batched occlusion query over a 2-D ray buffer; writes `0` or `1`
    /// per pixel. Inactive rays write `0`.
    pub fn query_occlusion(
        &self,
        ads: AdsHandle,
        rays: &RayBuffers,
        out: &mut [i32],
    ) -> Result<()> {
        let count = rays.validate(out.len())?;
        for i in 0..count {
            let d = rays.directions[i];
            if d[3] == 0.0 {
                out[i] = 0;
                continue;
            }
            out[i] = traverse::occlude_scene(&self.scene, ads, rays.ray(i))? as i32;
        }
        Ok(())
    }

    pub fn ray_buffer_requirements(&self, dimensions: &[u32]) -> Result<BufferInfo> {
        buffer_requirements(dimensions, TextureFormat::Rgba32F)
    }

    pub fn intersection_buffer_requirements(&self, dimensions: &[u32]) -> Result<BufferInfo> {
        buffer_requirements(dimensions, TextureFormat::Rgba32I)
    }

    pub fn occlusion_buffer_requirements(&self, dimensions: &[u32]) -> Result<BufferInfo> {
        buffer_requirements(dimensions, TextureFormat::R32I)
    }
}

fn buffer_requirements(dimensions: &[u32], format: TextureFormat) -> Result<BufferInfo> {
    let &[width, height] = dimensions else {
        return Err(Error::InvalidDimensions);
    };
    Ok(BufferInfo {
        format,
        width,
        height,
    })
}

fn max_tiling(a: Tiling, b: Tiling) -> Tiling {
    Tiling {
        size: a.size.max(b.size),
        width: a.width.max(b.width),
        height: a.height.max(b.height),
    }
}

/// 2-D ray buffer pair: per pixel `(origin.xyz, tmin_offset)` and
/// `(direction.xyz, tmax)`. A direction with `w == 0` marks the ray
/// inactive.
#[derive(Clone, Copy, Debug)]
pub struct RayBuffers<'a> {
    pub origins: &'a [[f32; 4]],
    pub directions: &'a [[f32; 4]],
    pub width: usize,
    pub height: usize,
}

impl RayBuffers<'_> {
    fn validate(&self, out_len: usize) -> Result<usize> {
        let count = self.width * self.height;
        if count == 0
            || self.origins.len() < count
            || self.directions.len() < count
            || out_len < count
        {
            return Err(Error::InvalidDimensions);
        }
        Ok(count)
    }

    fn ray(&self, i: usize) -> Ray {
        let o = self.origins[i];
        let d = self.directions[i];
        let dir = Vec3::new(d[0], d[1], d[2]);
        Ray::new(Vec3::new(o[0], o[1], o[2]) + dir * o[3], dir, d[3])
    }
}

pub fn version() -> (u32, u32) {
    let major = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    (major, minor)
}

pub fn version_string() -> &'static str {
    concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"))
}
