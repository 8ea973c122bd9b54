use crate::blas::{Blas, BlasKind, ShapeDesc};
use crate::error::{Error, Result};
use crate::tlas::Tlas;

pub const MAX_BLAS_COUNT: usize = 256;
pub const MAX_TLAS_COUNT: usize = 8;

/// High bit of a raw handle discriminates TLAS from BLAS.
pub const TLAS_ID_MASK: u32 = 0x8000_0000;

/// Bit position splitting a packed TLAS hit id into triangle (low) and
/// instance (high) parts.
pub const INSTANCE_TRIANGLE_SPLIT_BIT: u32 = 24;

bitflags::bitflags! {
    /// Work recorded by scene mutations and serviced by
    /// [`Context::update`](crate::Context::update), which returns the bits
    /// it cleared.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct UpdateFlags: u32 {
        const ACCESSOR_BINDINGS = 1;
        const ACCESSOR_CODE = 1 << 1;
        const INSTANCE_UPDATE = 1 << 2;
        const INSTANCE_ADD = 1 << 3;
    }
}

/// Non-owning ADS reference. The packed `u32` form exists for external
/// boundaries; inside the crate the tag does the discriminating.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AdsHandle {
    Blas(u32),
    Tlas(u32),
}

impl AdsHandle {
    pub fn to_raw(self) -> u32 {
        match self {
            AdsHandle::Blas(i) => i,
            AdsHandle::Tlas(i) => i | TLAS_ID_MASK,
        }
    }

    pub fn from_raw(raw: u32) -> AdsHandle {
        if raw & TLAS_ID_MASK != 0 {
            AdsHandle::Tlas(raw & !TLAS_ID_MASK)
        } else {
            AdsHandle::Blas(raw)
        }
    }

    pub fn is_tlas(self) -> bool {
        matches!(self, AdsHandle::Tlas(_))
    }
}

/// Value of the `"type"` descriptor key accepted by `create_ads`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, strum::Display, strum::EnumString)]
pub enum AdsType {
    #[default]
    #[strum(serialize = "BLAS")]
    Blas,
    #[strum(serialize = "TLAS")]
    Tlas,
}

/// Process-level registry of every BLAS and TLAS, with the dirty flags the
/// next update services. Owns all records; handles stay valid until the
/// scene is dropped.
#[derive(Debug)]
pub struct Scene {
    pub blas: Vec<Blas>,
    pub tlas: Vec<Tlas>,
    pub kind: BlasKind,
    pub update_flags: UpdateFlags,
    pub needs_update: bool,
}

impl Scene {
    pub fn new(kind: BlasKind) -> Scene {
        Scene {
            blas: Vec::new(),
            tlas: Vec::new(),
            kind,
            update_flags: UpdateFlags::empty(),
            needs_update: false,
        }
    }

    /// Allocates a BLAS or TLAS slot. Unrecognized descriptor keys and
    /// `"type"` values fall back to BLAS.
    pub fn create_ads(&mut self, descriptors: &[(&str, &str)]) -> Result<AdsHandle> {
        let mut ads_type = AdsType::Blas;
        for (key, value) in descriptors {
            if *key == "type" {
                ads_type = value.parse().unwrap_or_default();
            }
        }

        let handle = match ads_type {
            AdsType::Blas => {
                if self.blas.len() == MAX_BLAS_COUNT {
                    return Err(Error::BlasCapacity);
                }
                self.blas.push(Blas::new(self.kind));
                AdsHandle::Blas(self.blas.len() as u32 - 1)
            }
            AdsType::Tlas => {
                if self.tlas.len() == MAX_TLAS_COUNT {
                    return Err(Error::TlasCapacity);
                }
                self.tlas.push(Tlas::default());
                AdsHandle::Tlas(self.tlas.len() as u32 - 1)
            }
        };

        self.update_flags |= UpdateFlags::ACCESSOR_BINDINGS | UpdateFlags::ACCESSOR_CODE;
        Ok(handle)
    }

    pub fn blas(&self, handle: AdsHandle) -> Result<&Blas> {
        match handle {
            AdsHandle::Blas(i) => self.blas.get(i as usize).ok_or(Error::InvalidBlasHandle),
            AdsHandle::Tlas(_) => Err(Error::InvalidBlasHandle),
        }
    }

    pub fn tlas(&self, handle: AdsHandle) -> Result<&Tlas> {
        match handle {
            AdsHandle::Tlas(i) => self.tlas.get(i as usize).ok_or(Error::InvalidTlasHandle),
            AdsHandle::Blas(_) => Err(Error::InvalidTlasHandle),
        }
    }

    pub fn add_shape(&mut self, ads: AdsHandle, desc: &ShapeDesc) -> Result<u32> {
        let AdsHandle::Blas(i) = ads else {
            return Err(Error::InvalidAdsHandle);
        };
        let blas = self
            .blas
            .get_mut(i as usize)
            .ok_or(Error::InvalidBlasHandle)?;
        let shape_id = blas.add_shape(desc)?;

        self.needs_update = true;
        self.update_flags |= UpdateFlags::ACCESSOR_BINDINGS | UpdateFlags::ACCESSOR_CODE;
        Ok(shape_id)
    }

    pub fn add_instance(
        &mut self,
        tlas: AdsHandle,
        blas: AdsHandle,
        transform: &[f32; 12],
    ) -> Result<u32> {
        let AdsHandle::Tlas(t) = tlas else {
            return Err(Error::InvalidTlasHandle);
        };
        let AdsHandle::Blas(b) = blas else {
            return Err(Error::InvalidBlasHandle);
        };
        if b as usize >= self.blas.len() {
            return Err(Error::InvalidBlasHandle);
        }
        if !transform.iter().all(|v| v.is_finite()) {
            return Err(Error::InvalidTransform);
        }
        let tlas = self
            .tlas
            .get_mut(t as usize)
            .ok_or(Error::InvalidTlasHandle)?;
        let id = tlas.add_instance(b, transform);

        self.needs_update = true;
        self.update_flags |= UpdateFlags::INSTANCE_ADD;
        Ok(id)
    }

    pub fn update_instance(
        &mut self,
        tlas: AdsHandle,
        instance_id: u32,
        transform: &[f32; 12],
    ) -> Result<()> {
        let AdsHandle::Tlas(t) = tlas else {
            return Err(Error::InvalidTlasHandle);
        };
        let tlas = self
            .tlas
            .get_mut(t as usize)
            .ok_or(Error::InvalidTlasHandle)?;
        if instance_id as usize >= tlas.instances.len() {
            return Err(Error::InvalidInstanceId(instance_id));
        }
        if !transform.iter().all(|v| v.is_finite()) {
            return Err(Error::InvalidTransform);
        }
        tlas.instances[instance_id as usize].transform = *transform;

        self.needs_update = true;
        self.update_flags |= UpdateFlags::INSTANCE_UPDATE;
        Ok(())
    }

    /// Largest instance list across all TLAS; sizes the shared instance
    /// texture stride.
    pub fn max_instances(&self) -> usize {
        self.tlas.iter().map(|t| t.instances.len()).max().unwrap_or(0)
    }

    pub fn max_triangle_count(&self) -> usize {
        self.blas.iter().map(|b| b.triangles.len()).max().unwrap_or(0)
    }

    pub fn max_node_count(&self) -> usize {
        self.blas.iter().map(|b| b.total_nodes()).max().unwrap_or(0)
    }
}
