use anyhow::{Context, Result};
use std::collections::HashMap;

use crate::mesh::Mesh;
use crate::renderer::backend::{MeshHandle, RenderBackend, TextureHandle};
use crate::texture::TextureData;

/// Name to GPU handle lookup for meshes and textures.
///
/// Looking up a name that was never registered is a content error and panics.
#[derive(Debug, Default)]
pub struct ResourceTables {
    meshes: HashMap<String, MeshHandle>,
    textures: HashMap<String, TextureHandle>,
}

impl ResourceTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_mesh(&mut self, name: impl Into<String>, handle: MeshHandle) {
        self.meshes.insert(name.into(), handle);
    }

    pub fn insert_texture(&mut self, name: impl Into<String>, handle: TextureHandle) {
        self.textures.insert(name.into(), handle);
    }

    pub fn has_mesh(&self, name: &str) -> bool {
        self.meshes.contains_key(name)
    }

    pub fn has_texture(&self, name: &str) -> bool {
        self.textures.contains_key(name)
    }

    pub fn mesh(&self, name: &str) -> MeshHandle {
        match self.meshes.get(name) {
            Some(handle) => *handle,
            None => panic!("mesh '{name}' is not registered"),
        }
    }

    pub fn texture(&self, name: &str) -> TextureHandle {
        match self.textures.get(name) {
            Some(handle) => *handle,
            None => panic!("texture '{name}' is not registered"),
        }
    }

    pub fn upload_mesh<B: RenderBackend>(&mut self, backend: &mut B, name: &str, mesh: &Mesh) -> Result<()> {
        let handle = backend.upload_mesh(mesh).with_context(|| format!("Failed to upload mesh '{name}'"))?;
        self.insert_mesh(name, handle);
        Ok(())
    }

    pub fn upload_texture<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        name: &str,
        texture: &TextureData,
    ) -> Result<()> {
        let handle =
            backend.upload_texture(texture).with_context(|| format!("Failed to upload texture '{name}'"))?;
        self.insert_texture(name, handle);
        Ok(())
    }

    /// Procedural stand-ins for the demo scene's meshes and textures.
    pub fn upload_demo<B: RenderBackend>(backend: &mut B) -> Result<Self> {
        let mut tables = Self::new();
        tables.upload_mesh(backend, "cube", &Mesh::cube(2.0))?;
        tables.upload_mesh(backend, "sphere", &Mesh::uv_sphere(1.0, 48, 24))?;
        tables.upload_texture(
            backend,
            "wood",
            &TextureData::checker(256, 32, [150, 111, 51, 255], [120, 85, 40, 255]),
        )?;
        tables.upload_texture(
            backend,
            "brick",
            &TextureData::checker(256, 16, [170, 74, 68, 255], [200, 200, 200, 255]),
        )?;
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_registered_handles() {
        let mut tables = ResourceTables::new();
        tables.insert_mesh("cube", MeshHandle(3));
        tables.insert_texture("wood", TextureHandle(9));
        assert_eq!(tables.mesh("cube"), MeshHandle(3));
        assert_eq!(tables.texture("wood"), TextureHandle(9));
        assert!(!tables.has_mesh("sphere"));
    }

    #[test]
    #[should_panic(expected = "mesh 'missing' is not registered")]
    fn unknown_mesh_panics() {
        ResourceTables::new().mesh("missing");
    }
}
