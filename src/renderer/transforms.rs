use glam::Mat4;

use super::backend::{BufferHandle, RenderBackend};
use super::cascades::Cascade;

/// Matrix slots in the shared transform buffer; shaders declare the same array length.
pub const MAX_CASCADES: usize = 16;

/// All cascade light-space matrices for the current frame, uploaded once before the shadow pass.
pub struct SharedTransformBuffer {
    handle: BufferHandle,
    matrices: [Mat4; MAX_CASCADES],
    len: usize,
    uploads: u64,
}

impl SharedTransformBuffer {
    pub fn new<B: RenderBackend>(backend: &mut B) -> Self {
        let handle = backend.create_transform_buffer(MAX_CASCADES);
        Self { handle, matrices: [Mat4::IDENTITY; MAX_CASCADES], len: 0, uploads: 0 }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn upload<B: RenderBackend>(&mut self, backend: &mut B, cascades: &[Cascade]) {
        if cascades.len() > MAX_CASCADES {
            log::warn!(
                "{} cascades requested; only the first {MAX_CASCADES} fit the transform buffer",
                cascades.len()
            );
        }
        self.len = cascades.len().min(MAX_CASCADES);
        for (slot, cascade) in self.matrices.iter_mut().zip(cascades.iter()) {
            *slot = cascade.light_view_projection;
        }
        for slot in self.matrices.iter_mut().skip(self.len) {
            *slot = Mat4::IDENTITY;
        }
        backend.write_transforms(self.handle, &self.matrices);
        self.uploads += 1;
    }

    /// Matrices written by the last upload.
    pub fn matrices(&self) -> &[Mat4] {
        &self.matrices[..self.len]
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads
    }
}
