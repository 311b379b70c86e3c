//! Greyscale intensity images and the sampling the regressors read from.

use crate::shape::{PixelCoordinates, PixelIntensities};

/// A 2-D array of single-precision intensities in [0, 1].
///
/// Out-of-bounds access returns 0; interior sampling is bilinear. The
/// interpolation mode is part of a trained model's behavior and must not
/// change between training and prediction.
#[derive(Debug, Clone)]
pub struct Image {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Image {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), width * height);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn from_fn<F>(width: usize, height: usize, f: F) -> Self
    where
        F: Fn(usize, usize) -> f32,
    {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Convert 8-bit greyscale rows to normalized intensities.
    pub fn from_luma8(width: usize, height: usize, pixels: &[u8]) -> Self {
        debug_assert_eq!(pixels.len(), width * height);
        let data = pixels.iter().map(|&p| f32::from(p) / 255.0).collect();
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Intensity at integer coordinates; 0 outside the image.
    #[inline]
    pub fn get(&self, x: i32, y: i32) -> f32 {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0.0;
        }
        self.data[y as usize * self.width + x as usize]
    }

    /// Bilinearly interpolated intensity at sub-pixel coordinates.
    #[inline]
    pub fn bilinear(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor() as i32;
        let y0 = y.floor() as i32;
        let x1 = x0 + 1;
        let y1 = y0 + 1;

        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let p00 = self.get(x0, y0);
        let p10 = self.get(x1, y0);
        let p01 = self.get(x0, y1);
        let p11 = self.get(x1, y1);

        let top = p00 * (1.0 - fx) + p10 * fx;
        let bottom = p01 * (1.0 - fx) + p11 * fx;
        top * (1.0 - fy) + bottom * fy
    }
}

/// Sample intensities at the x/y components of image-frame coordinates.
/// The z component is carried through transforms but plays no part in the
/// lookup.
pub fn read_image(image: &Image, coords: &PixelCoordinates) -> PixelIntensities {
    let mut intensities = PixelIntensities::zeros(coords.ncols());
    for i in 0..coords.ncols() {
        intensities[i] = image.bilinear(coords[(0, i)], coords[(1, i)]);
    }
    intensities
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_is_zero() {
        let img = Image::from_fn(3, 3, |x, y| if (x + y) % 2 == 0 { 0.0 } else { 1.0 });

        assert_eq!(img.get(0, 0), 0.0);
        assert_eq!(img.get(1, 0), 1.0);
        assert_eq!(img.get(-1, 0), 0.0);
        assert_eq!(img.get(3, 0), 0.0);
        assert_eq!(img.get(0, 3), 0.0);
    }

    #[test]
    fn bilinear_interpolation() {
        let img = Image::new(2, 2, vec![0.0, 0.4, 0.8, 0.2]);

        // Integer coordinates hit exact pixel values.
        assert!((img.bilinear(0.0, 0.0) - 0.0).abs() < 1e-6);
        assert!((img.bilinear(1.0, 0.0) - 0.4).abs() < 1e-6);
        assert!((img.bilinear(0.0, 1.0) - 0.8).abs() < 1e-6);
        assert!((img.bilinear(1.0, 1.0) - 0.2).abs() < 1e-6);

        // Center is the mean of all four.
        assert!((img.bilinear(0.5, 0.5) - 0.35).abs() < 1e-6);

        // Halfway along the top row.
        assert!((img.bilinear(0.5, 0.0) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn read_image_uses_xy_only() {
        let img = Image::from_fn(10, 10, |x, _| x as f32 / 10.0);
        let coords = PixelCoordinates::from_column_slice(&[
            2.0, 5.0, 123.0, // z is ignored
            7.0, 5.0, -9.0,
        ]);

        let intensities = read_image(&img, &coords);
        assert_eq!(intensities.len(), 2);
        assert!((intensities[0] - 0.2).abs() < 1e-6);
        assert!((intensities[1] - 0.7).abs() < 1e-6);
    }

    #[test]
    fn luma_conversion_normalizes() {
        let img = Image::from_luma8(2, 1, &[0, 255]);
        assert_eq!(img.get(0, 0), 0.0);
        assert_eq!(img.get(1, 0), 1.0);
    }
}
