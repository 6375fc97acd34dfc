//! Image preprocessing for the VGG16 trunk
//!
//! The trunk was trained on BGR images in the [0, 255] range with the
//! per-channel mean removed, so the pipeline is:
//! 1. Load image and convert to tensor (BGR, CHW format, values in [0, 255])
//! 2. Subtract the VGG mean
//! 3. Add the batch dimension

use std::path::Path;

use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::error::Result;

/// VGG16 mean pixel (BGR order)
pub const VGG_MEAN_BGR: [f32; 3] = [104.00698793, 116.66876762, 122.67891434];

/// Load an image from disk and return it as a DynamicImage
pub fn load_image(path: impl AsRef<Path>) -> Result<DynamicImage> {
    Ok(image::open(path)?)
}

/// Convert a DynamicImage to a tensor in CHW format, BGR channel order
///
/// # Returns
/// Tensor of shape [3, H, W] with values in [0.0, 255.0]
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = img.to_rgb8();
    let (width, height) = img.dimensions();
    let h = height as usize;
    let w = width as usize;

    // raw is [R, G, B, R, G, B, ...] row by row
    let raw = img.into_raw();
    let mut chw = vec![0.0f32; 3 * h * w];
    for (i, px) in raw.chunks_exact(3).enumerate() {
        chw[i] = px[2] as f32; // B
        chw[h * w + i] = px[1] as f32; // G
        chw[2 * h * w + i] = px[0] as f32; // R
    }

    Ok(Tensor::from_vec(chw, (3, h, w), device)?)
}

/// Subtract the VGG mean from a [3, H, W] BGR tensor
pub fn subtract_mean(tensor: &Tensor) -> Result<Tensor> {
    let _ = tensor.dims3()?;
    let mean = Tensor::from_slice(&VGG_MEAN_BGR, (3, 1, 1), tensor.device())?;
    Ok(tensor.broadcast_sub(&mean)?)
}

/// Add batch dimension to a preprocessed image tensor
///
/// [3, H, W] -> [1, 3, H, W]
pub fn add_batch_dim(tensor: &Tensor) -> Result<Tensor> {
    Ok(tensor.unsqueeze(0)?)
}

/// Full preprocessing: convert, subtract the mean and batch.
pub fn preprocess_image(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let tensor = image_to_tensor(img, device)?;
    let tensor = subtract_mean(&tensor)?;
    add_batch_dim(&tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_image_to_tensor_is_bgr() {
        let device = Device::Cpu;
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([10, 20, 30]));
        img.put_pixel(1, 0, Rgb([40, 50, 60]));
        let tensor = image_to_tensor(&DynamicImage::ImageRgb8(img), &device).unwrap();

        assert_eq!(tensor.dims(), &[3, 1, 2]);
        let data: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(data, vec![30.0, 60.0, 20.0, 50.0, 10.0, 40.0]);
    }

    #[test]
    fn test_subtract_mean() {
        let device = Device::Cpu;
        let input = Tensor::zeros((3, 2, 2), DType::F32, &device).unwrap();
        let centered = subtract_mean(&input).unwrap();
        let data: Vec<f32> = centered.flatten_all().unwrap().to_vec1().unwrap();

        assert!((data[0] + VGG_MEAN_BGR[0]).abs() < 1e-4);
        assert!((data[4] + VGG_MEAN_BGR[1]).abs() < 1e-4);
        assert!((data[8] + VGG_MEAN_BGR[2]).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_image_shape() {
        let device = Device::Cpu;
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 8, Rgb([123, 117, 104])));
        let x = preprocess_image(&img, &device).unwrap();
        assert_eq!(x.dims(), &[1, 3, 8, 16]);

        // the mean pixel maps to roughly zero
        let max = x.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max < 1.0);
    }

    #[test]
    fn test_add_batch_dim() {
        let device = Device::Cpu;
        let input = Tensor::zeros((3, 64, 48), DType::F32, &device).unwrap();
        let batched = add_batch_dim(&input).unwrap();

        assert_eq!(batched.dims(), &[1, 3, 64, 48]);
    }
}
