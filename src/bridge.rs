//! Contract between the animation scheduler and the rendering backend.
//!
//! The scheduler writes per-instance transforms and colors by index and
//! flushes each batch exactly once per tick; the backend decides how the
//! batches reach the GPU.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Opaque handle to an instanced batch owned by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BatchHandle(pub(crate) usize);

/// Mesh selection for a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchGeometry {
    /// Unit box with its pivot at the base, so Y scale is building height.
    Tower,
    /// Thin painted road-marking slab.
    RoadLine,
}

/// GPU-layout per-instance attributes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct RawInstance {
    pub model: [[f32; 4]; 4],
    pub color: [f32; 4],
}

impl RawInstance {
    pub fn new(model: Mat4, color: Vec4) -> Self {
        Self {
            model: model.to_cols_array_2d(),
            color: color.to_array(),
        }
    }

    /// An instance parked far off-scene with zero extent.
    pub fn hidden() -> Self {
        let model = Mat4::from_translation(Vec3::new(0.0, -1000.0, 0.0)) * Mat4::from_scale(Vec3::ZERO);
        Self::new(model, Vec4::ZERO)
    }
}

/// Batched instanced drawing, O(1) GPU syncs per tick.
///
/// `set_instance_*` calls stage CPU-side only; nothing reaches the GPU until
/// `commit`, which flushes a batch's dirty staging exactly once.
pub trait RendererBridge {
    fn create_instanced_batch(&mut self, count: usize, geometry: BatchGeometry) -> BatchHandle;
    fn set_instance_transform(&mut self, batch: BatchHandle, index: usize, transform: Mat4);
    fn set_instance_color(&mut self, batch: BatchHandle, index: usize, color: Vec4);
    fn commit(&mut self, batch: BatchHandle);
    fn resize(&mut self, width: u32, height: u32);
}

/// CPU staging for one batch; backends embed this and flush it on commit.
pub struct StagedBatch {
    pub geometry: BatchGeometry,
    pub instances: Vec<RawInstance>,
    pub dirty: bool,
}

impl StagedBatch {
    pub fn new(count: usize, geometry: BatchGeometry) -> Self {
        Self {
            geometry,
            instances: vec![RawInstance::hidden(); count],
            dirty: true,
        }
    }

    pub fn set_transform(&mut self, index: usize, transform: Mat4) {
        self.instances[index].model = transform.to_cols_array_2d();
        self.dirty = true;
    }

    pub fn set_color(&mut self, index: usize, color: Vec4) {
        self.instances[index].color = color.to_array();
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_batch_dirty_tracking() {
        let mut batch = StagedBatch::new(4, BatchGeometry::Tower);
        batch.dirty = false;
        batch.set_transform(2, Mat4::IDENTITY);
        assert!(batch.dirty);
        assert_eq!(batch.instances.len(), 4);
    }

    #[test]
    fn test_hidden_instance_has_zero_extent() {
        let hidden = RawInstance::hidden();
        // Zero basis vectors: the instance cannot rasterize anything.
        assert_eq!(hidden.model[0][0], 0.0);
        assert_eq!(hidden.model[1][1], 0.0);
        assert_eq!(hidden.model[2][2], 0.0);
        assert_eq!(hidden.model[3][1], -1000.0);
    }
}
