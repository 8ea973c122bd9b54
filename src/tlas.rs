use glam::{Mat4, Vec4};

/// One BLAS reference with a 3×4 row-major transform: three rows of
/// `(m0, m1, m2, translation)`.
#[derive(Clone, Copy, Debug)]
pub struct Instance {
    pub transform: [f32; 12],
    pub blas_id: u32,
}

impl Instance {
    /// Object-to-world matrix.
    pub fn object_transform(&self) -> Mat4 {
        let t = &self.transform;
        Mat4::from_cols(
            Vec4::new(t[0], t[4], t[8], 0.0),
            Vec4::new(t[1], t[5], t[9], 0.0),
            Vec4::new(t[2], t[6], t[10], 0.0),
            Vec4::new(t[3], t[7], t[11], 1.0),
        )
    }

    /// Transform for directions and normals.
    pub fn normal_transform(&self) -> Mat4 {
        self.object_transform().inverse().transpose()
    }
}

/// Top-level structure: a flat instance list. Traversal iterates all
/// instances; there is no internal spatial index.
#[derive(Debug, Default)]
pub struct Tlas {
    pub instances: Vec<Instance>,
}

/// Texels each packed instance occupies: three transform rows plus the
/// BLAS id word.
pub const INSTANCE_TEXELS: usize = 4;

impl Tlas {
    pub fn add_instance(&mut self, blas_id: u32, transform: &[f32; 12]) -> u32 {
        let id = self.instances.len() as u32;
        self.instances.push(Instance {
            transform: *transform,
            blas_id,
        });
        id
    }

    /// Packs the instance list into RGBA32F texels, padded to `stride`
    /// instances so every TLAS layer has the same row length.
    pub fn packed(&self, stride: usize) -> Vec<Vec4> {
        let mut out = vec![Vec4::ZERO; stride * INSTANCE_TEXELS];
        for (i, inst) in self.instances.iter().enumerate() {
            let t = &inst.transform;
            let base = i * INSTANCE_TEXELS;
            out[base] = Vec4::new(t[0], t[1], t[2], t[3]);
            out[base + 1] = Vec4::new(t[4], t[5], t[6], t[7]);
            out[base + 2] = Vec4::new(t[8], t[9], t[10], t[11]);
            out[base + 3] = Vec4::new(f32::from_bits(inst.blas_id), 0.0, 0.0, 0.0);
        }
        out
    }
}
