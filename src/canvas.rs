//! Pixel buffers for the remap pipeline
//!
//! Every pixel is one 32-bit word. The channel order inside the word is
//! whatever the loader packed; the remap strategies only move whole words.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{RgbImage, RgbaImage};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{info, warn};

use crate::config::Resolution;

/// Destination buffer written by the apply strategies
///
/// Pixels are `AtomicU32` so that parallel workers may write to the same
/// destination without a data race. Stores are `Relaxed`, which is a plain
/// store on every supported target.
pub struct Canvas {
    resolution: Resolution,
    pixels: Box<[AtomicU32]>,
}

impl Canvas {
    /// Create a black canvas
    pub fn new(resolution: Resolution) -> Self {
        let pixels = (0..resolution.pixel_count())
            .map(|_| AtomicU32::new(0))
            .collect();
        Self { resolution, pixels }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn pixels(&self) -> &[AtomicU32] {
        &self.pixels
    }

    /// Reset every pixel to zero
    pub fn clear(&self) {
        for pixel in self.pixels.iter() {
            pixel.store(0, Ordering::Relaxed);
        }
    }

    /// Copy the current contents out as plain words
    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<u32> {
        self.pixels
            .iter()
            .map(|p| p.load(Ordering::Relaxed))
            .collect()
    }

    /// Packed RGB24 copy of the canvas, alpha dropped
    pub fn to_rgb(&self) -> Vec<u8> {
        let mut rgb = Vec::with_capacity(self.len() * 3);
        for pixel in self.pixels.iter() {
            let [r, g, b, _] = pixel.load(Ordering::Relaxed).to_ne_bytes();
            rgb.extend_from_slice(&[r, g, b]);
        }
        rgb
    }
}

/// A decoded source frame at the processing resolution
#[derive(Debug, Clone)]
pub struct SourceFrame {
    resolution: Resolution,
    pixels: Vec<u32>,
}

impl SourceFrame {
    /// Decode an image file and scale it to `resolution` if needed
    pub fn load(path: &Path, resolution: Resolution) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("Failed to load the image {:?}", path))?
            .to_rgba8();

        info!("Loaded {:?} ({}x{})", path, image.width(), image.height());

        let image = if image.width() != resolution.width || image.height() != resolution.height {
            warn!(
                "Image is {}x{}, scaling to {}",
                image.width(),
                image.height(),
                resolution
            );
            image::imageops::resize(&image, resolution.width, resolution.height, FilterType::Triangle)
        } else {
            image
        };

        Ok(Self::from_rgba(&image))
    }

    /// Pack an RGBA image, one word per pixel
    pub fn from_rgba(image: &RgbaImage) -> Self {
        let pixels = image
            .pixels()
            .map(|p| u32::from_ne_bytes(p.0))
            .collect();
        Self {
            resolution: Resolution::new(image.width(), image.height()),
            pixels,
        }
    }

    #[cfg(test)]
    pub fn from_words(resolution: Resolution, pixels: Vec<u32>) -> Result<Self> {
        anyhow::ensure!(
            pixels.len() == resolution.pixel_count(),
            "source has {} pixels, expected {} for {}",
            pixels.len(),
            resolution.pixel_count(),
            resolution
        );
        Ok(Self { resolution, pixels })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn words(&self) -> &[u32] {
        &self.pixels
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        let mut rgb = Vec::with_capacity(self.pixels.len() * 3);
        for word in &self.pixels {
            let [r, g, b, _] = word.to_ne_bytes();
            rgb.extend_from_slice(&[r, g, b]);
        }
        RgbImage::from_raw(self.resolution.width, self.resolution.height, rgb)
            .unwrap_or_else(|| RgbImage::new(self.resolution.width, self.resolution.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_new_canvas_is_black() {
        let canvas = Canvas::new(Resolution::new(4, 3));
        assert_eq!(canvas.len(), 12);
        assert!(canvas.snapshot().iter().all(|&p| p == 0));
    }

    #[test]
    fn test_canvas_to_rgb() {
        let canvas = Canvas::new(Resolution::new(2, 1));
        canvas.pixels()[1].store(u32::from_ne_bytes([10, 20, 30, 255]), Ordering::Relaxed);
        assert_eq!(canvas.to_rgb(), vec![0, 0, 0, 10, 20, 30]);

        canvas.clear();
        assert_eq!(canvas.to_rgb(), vec![0; 6]);
    }

    #[test]
    fn test_source_from_rgba() {
        let mut image = RgbaImage::new(3, 2);
        image.put_pixel(2, 1, Rgba([1, 2, 3, 4]));
        let source = SourceFrame::from_rgba(&image);

        assert_eq!(source.resolution(), Resolution::new(3, 2));
        assert_eq!(source.words().len(), 6);
        assert_eq!(source.words()[5].to_ne_bytes(), [1, 2, 3, 4]);
        assert_eq!(source.to_rgb_image().get_pixel(2, 1).0, [1, 2, 3]);
    }

    #[test]
    fn test_source_size_checked() {
        assert!(SourceFrame::from_words(Resolution::new(2, 2), vec![0; 3]).is_err());
        assert!(SourceFrame::from_words(Resolution::new(2, 2), vec![0; 4]).is_ok());
    }

    #[test]
    fn test_load_missing_image() {
        let result = SourceFrame::load(Path::new("/nonexistent/frame.png"), Resolution::default());
        assert!(result.is_err());
    }
}
