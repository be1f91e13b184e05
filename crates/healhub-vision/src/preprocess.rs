//! Image preprocessing for model input
//!
//! Every loaded artifact records the input size and the pixel
//! normalization regime it was trained with. Both are defined here and
//! nowhere else: a model fed with the wrong regime does not fail, it just
//! produces low-confidence output.

use base64::Engine;
use candle_core::{Device, Tensor};
use healhub_core::{Error, Result};
use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default square input size for the primary multiclass model
pub const PRIMARY_INPUT_SIZE: u32 = 224;

/// Default square input size for binary and auxiliary models
pub const AUXILIARY_INPUT_SIZE: u32 = 180;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Pixel normalization regime expected by a model family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Normalization {
    /// x / 255, range [0, 1]
    #[serde(rename = "unit_scale")]
    UnitScale,

    /// x / 127.5 - 1, range [-1, 1] (MobileNet-style backbones)
    #[serde(rename = "symmetric")]
    Symmetric,

    /// (x / 255 - mean) / std with ImageNet statistics (torchvision ResNets)
    #[serde(rename = "imagenet")]
    ImageNet,
}

impl Normalization {
    /// Normalize one 8-bit channel value
    #[inline]
    pub fn apply(&self, value: u8, channel: usize) -> f32 {
        let v = value as f32;
        match self {
            Self::UnitScale => v / 255.0,
            Self::Symmetric => v / 127.5 - 1.0,
            Self::ImageNet => (v / 255.0 - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel],
        }
    }
}

impl std::fmt::Display for Normalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::UnitScale => "unit_scale",
            Self::Symmetric => "symmetric",
            Self::ImageNet => "imagenet",
        };
        f.write_str(name)
    }
}

/// Model input size in pixels.
///
/// Accepts either a single number (square) or a `[width, height]` pair in
/// configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "InputSizeSpec", into = "InputSizeSpec")]
pub struct InputSize {
    pub width: u32,
    pub height: u32,
}

impl InputSize {
    pub const fn square(side: u32) -> Self {
        Self {
            width: side,
            height: side,
        }
    }

    pub fn as_tuple(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
enum InputSizeSpec {
    Square(u32),
    Dims([u32; 2]),
}

impl From<InputSizeSpec> for InputSize {
    fn from(spec: InputSizeSpec) -> Self {
        match spec {
            InputSizeSpec::Square(side) => Self::square(side),
            InputSizeSpec::Dims([width, height]) => Self { width, height },
        }
    }
}

impl From<InputSize> for InputSizeSpec {
    fn from(size: InputSize) -> Self {
        if size.width == size.height {
            Self::Square(size.width)
        } else {
            Self::Dims([size.width, size.height])
        }
    }
}

/// Decoded RGB image, shared by every model that runs on one request
pub struct DecodedImage {
    rgb: RgbImage,
}

impl DecodedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        self.rgb.dimensions()
    }
}

/// Decode raw image bytes (JPEG, PNG, ...) into a 3-channel image
pub fn decode(bytes: &[u8]) -> Result<DecodedImage> {
    if bytes.is_empty() {
        return Err(Error::EmptyInput);
    }

    let img = image::load_from_memory(bytes).map_err(|e| Error::decode(e.to_string()))?;

    Ok(DecodedImage { rgb: img.to_rgb8() })
}

/// Decode a base64 image payload, with or without a `data:` URL prefix
pub fn decode_base64(payload: &str) -> Result<Vec<u8>> {
    let trimmed = payload.trim();
    let data = match trimmed.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => trimmed,
    };

    if data.is_empty() {
        return Err(Error::EmptyInput);
    }

    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::decode(format!("invalid base64 image: {}", e)))
}

/// Resize and normalize into a `[1, 3, height, width]` f32 tensor
pub fn prepare(
    image: &DecodedImage,
    size: InputSize,
    normalization: Normalization,
    device: &Device,
) -> Result<Tensor> {
    let resized = if image.rgb.dimensions() == size.as_tuple() {
        image.rgb.clone()
    } else {
        image::imageops::resize(&image.rgb, size.width, size.height, FilterType::Triangle)
    };

    let (w, h) = (size.width as usize, size.height as usize);
    let plane = w * h;
    let mut data = vec![0f32; 3 * plane];

    for (x, y, pixel) in resized.enumerate_pixels() {
        let offset = y as usize * w + x as usize;
        for c in 0..3 {
            data[c * plane + offset] = normalization.apply(pixel[c], c);
        }
    }

    Tensor::from_vec(data, (1, 3, h, w), device)
        .map_err(|e| Error::internal(format!("failed to build input tensor: {}", e)))
}

/// Per-request memo of prepared tensors.
///
/// Models sharing an input size and normalization share one tensor.
pub struct InputCache<'a> {
    image: &'a DecodedImage,
    device: &'a Device,
    tensors: HashMap<(InputSize, Normalization), Tensor>,
}

impl<'a> InputCache<'a> {
    pub fn new(image: &'a DecodedImage, device: &'a Device) -> Self {
        Self {
            image,
            device,
            tensors: HashMap::new(),
        }
    }

    /// Get or build the tensor for a size/normalization pair
    pub fn get(&mut self, size: InputSize, normalization: Normalization) -> Result<Tensor> {
        if let Some(tensor) = self.tensors.get(&(size, normalization)) {
            return Ok(tensor.clone());
        }

        let tensor = prepare(self.image, size, normalization, self.device)?;
        self.tensors.insert((size, normalization), tensor.clone());
        Ok(tensor)
    }

    /// Number of distinct tensors built so far
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageOutputFormat, Rgb};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode(b"definitely not an image").err().unwrap();
        assert!(matches!(err, Error::Decode(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_decode_empty() {
        assert!(matches!(decode(&[]), Err(Error::EmptyInput)));
    }

    #[test]
    fn test_prepare_shape_and_range() {
        let image = decode(&png_bytes(10, 6, [255, 0, 128])).unwrap();
        let tensor = prepare(
            &image,
            InputSize::square(4),
            Normalization::UnitScale,
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 4, 4]);

        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((values[0] - 1.0).abs() < 1e-6);
        assert!(values[16].abs() < 1e-6);
        assert!((values[32] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_prepare_non_square() {
        let image = decode(&png_bytes(3, 3, [0, 0, 0])).unwrap();
        let size = InputSize {
            width: 5,
            height: 2,
        };
        let tensor = prepare(&image, size, Normalization::Symmetric, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 2, 5]);

        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (v + 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_normalization_regimes() {
        assert_eq!(Normalization::UnitScale.apply(255, 0), 1.0);
        assert_eq!(Normalization::Symmetric.apply(0, 1), -1.0);
        assert!((Normalization::Symmetric.apply(255, 2) - 1.0).abs() < 1e-6);

        let v = Normalization::ImageNet.apply(0, 0);
        assert!((v - (-0.485 / 0.229)).abs() < 1e-5);
    }

    #[test]
    fn test_input_cache_shares_tensors() {
        let image = decode(&png_bytes(8, 8, [10, 20, 30])).unwrap();
        let device = Device::Cpu;
        let mut cache = InputCache::new(&image, &device);

        cache
            .get(InputSize::square(4), Normalization::UnitScale)
            .unwrap();
        cache
            .get(InputSize::square(4), Normalization::UnitScale)
            .unwrap();
        cache
            .get(InputSize::square(4), Normalization::Symmetric)
            .unwrap();
        cache
            .get(InputSize::square(6), Normalization::Symmetric)
            .unwrap();

        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_decode_base64_variants() {
        let raw = png_bytes(2, 2, [1, 2, 3]);
        let encoded = base64::engine::general_purpose::STANDARD.encode(&raw);

        assert_eq!(decode_base64(&encoded).unwrap(), raw);

        let data_url = format!("data:image/png;base64,{}", encoded);
        assert_eq!(decode_base64(&data_url).unwrap(), raw);

        assert!(matches!(decode_base64("   "), Err(Error::EmptyInput)));
        assert!(matches!(decode_base64("%%%"), Err(Error::Decode(_))));
    }

    #[test]
    fn test_input_size_yaml() {
        let square: InputSize = serde_yaml::from_str("224").unwrap();
        assert_eq!(square, InputSize::square(224));

        let dims: InputSize = serde_yaml::from_str("[320, 240]").unwrap();
        assert_eq!(dims.as_tuple(), (320, 240));
    }
}
