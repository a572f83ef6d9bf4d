use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub(crate) fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Resizes `img` to exactly `width` x `height` and lays it out as the
/// (1, 3, height, width) f32 tensor in [-1, 1] that the autoencoders expect.
pub(crate) fn image_to_tensor(
    img: &DynamicImage,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    let img = img
        .resize_exact(width as u32, height as u32, FilterType::CatmullRom)
        .to_rgb8();
    let data = img.into_raw();
    let tensor = Tensor::from_vec(data, (height, width, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor)
}

/// Maps a decoded latent batch back to pixels: clamp to [-1, 1], rescale to u8.
pub(crate) fn decoded_to_image(decoded: &Tensor) -> Result<DynamicImage> {
    let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
    tensor_to_image(&img.i(0)?)
}
