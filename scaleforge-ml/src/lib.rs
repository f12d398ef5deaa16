pub mod esrgan;

use anyhow::Result;
use candle_core::{DType, Device, Tensor, utils::metal_is_available};
use image::{DynamicImage, RgbImage};

/// Name of the compute device being used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Cuda => write!(f, "CUDA"),
            DeviceKind::Metal => write!(f, "Metal"),
        }
    }
}

/// Returns the kind of device that `device()` would select.
pub fn device_kind(cpu: bool) -> DeviceKind {
    if cpu {
        DeviceKind::Cpu
    } else if cuda_is_available() {
        DeviceKind::Cuda
    } else if metal_is_available() {
        DeviceKind::Metal
    } else {
        DeviceKind::Cpu
    }
}

pub fn device(cpu: bool) -> Result<Device> {
    match device_kind(cpu) {
        DeviceKind::Cpu => {
            if !cpu {
                tracing::info!("CUDA and Metal are not available, using CPU device");
            }
            Ok(Device::Cpu)
        }
        DeviceKind::Cuda => Ok(Device::new_cuda(0)?),
        DeviceKind::Metal => Ok(Device::new_metal(0)?),
    }
}

/// The driver library must be loadable AND the crate must be built with the
/// `cuda` feature; either alone is not enough.
pub fn cuda_is_available() -> bool {
    (unsafe {
        libloading::Library::new(if cfg!(target_os = "windows") {
            "nvcuda.dll"
        } else {
            "libcuda.so"
        })
        .is_ok()
    }) && cfg!(feature = "cuda")
}

/// RGB image to a `1x3xHxW` float tensor in `[0, 1]`.
pub fn image_to_tensor(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let rgb = image.to_rgb8().into_raw();
    let tensor = (Tensor::from_vec(rgb, (1, h, w, 3), device)?
        .permute((0, 3, 1, 2))?
        .to_dtype(DType::F32)?
        * (1. / 255.))?;
    Ok(tensor)
}

/// `1x3xHxW` float tensor in `[0, 1]` back to an RGB image.
pub fn tensor_to_image(tensor: &Tensor) -> Result<DynamicImage> {
    let tensor = tensor.to_device(&Device::Cpu)?.squeeze(0)?;
    let (channels, height, width) = tensor.dims3()?;
    anyhow::ensure!(channels == 3, "expected 3 channels, got {channels}");
    let tensor = (tensor * 255.)?
        .round()?
        .clamp(0., 255.)?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?; // HWC for ImageBuffer
    let raw: Vec<u8> = tensor.flatten_all()?.to_vec1()?;
    let image = RgbImage::from_raw(width as u32, height as u32, raw)
        .ok_or_else(|| anyhow::anyhow!("failed to create image buffer from tensor"))?;
    Ok(DynamicImage::ImageRgb8(image))
}
