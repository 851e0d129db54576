use anyhow::{bail, Result};

/// Tightly packed RGBA8 pixels, row-major from the top-left texel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("Texture dimensions must be non-zero (got {width}x{height})");
        }
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            bail!("Texture {width}x{height} expects {expected} bytes, got {}", pixels.len());
        }
        Ok(Self { width, height, pixels })
    }

    pub fn solid(rgba: [u8; 4]) -> Self {
        Self { width: 1, height: 1, pixels: rgba.to_vec() }
    }

    /// Two-tone checkerboard; `cell` is the edge length of one square in texels.
    pub fn checker(size: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Self {
        let size = size.max(1);
        let cell = cell.max(1);
        let mut pixels = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let even = ((x / cell) + (y / cell)) % 2 == 0;
                pixels.extend_from_slice(if even { &a } else { &b });
            }
        }
        Self { width: size, height: size, pixels }
    }

    pub fn bytes_per_row(&self) -> u32 {
        self.width * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checker_alternates_cells() {
        let tex = TextureData::checker(4, 2, [255, 0, 0, 255], [0, 0, 255, 255]);
        assert_eq!(tex.pixels.len(), 64);
        assert_eq!(&tex.pixels[0..4], &[255, 0, 0, 255]);
        assert_eq!(&tex.pixels[8..12], &[0, 0, 255, 255]);
        let row_two = (2 * 4 * 4) as usize;
        assert_eq!(&tex.pixels[row_two..row_two + 4], &[0, 0, 255, 255]);
    }

    #[test]
    fn rejects_mismatched_pixel_buffer() {
        let err = TextureData::from_rgba8(2, 2, vec![0; 12]).unwrap_err();
        assert!(err.to_string().contains("expects 16 bytes"));
        assert!(TextureData::from_rgba8(0, 2, Vec::new()).is_err());
    }
}
