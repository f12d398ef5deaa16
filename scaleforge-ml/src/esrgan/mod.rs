mod model;

use std::path::Path;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use image::DynamicImage;

use crate::{image_to_tensor, tensor_to_image};

/// Tiles overlap by this many input pixels so seams fall in regions both
/// neighbors computed with full context.
const TILE_OVERLAP: usize = 8;

pub struct Esrgan {
    model: model::RrdbNet,
    device: Device,
}

impl Esrgan {
    /// Load safetensors weights from `path` for the given architecture
    /// parameters (registry-provided).
    pub fn load(
        path: &Path,
        device: Device,
        num_feat: usize,
        num_block: usize,
        scale: u32,
    ) -> Result<Self> {
        let data = std::fs::read(path)?;
        let vb = VarBuilder::from_buffered_safetensors(data, DType::F32, &device)?;
        let model = model::RrdbNet::load(&vb, num_feat, num_block, scale)?;
        Ok(Self { model, device })
    }

    pub fn scale(&self) -> u32 {
        self.model.scale()
    }

    /// Upscale an image by the model's native factor. With `tile` set, the
    /// input is processed in overlapping tiles of roughly that many pixels
    /// per side to bound device memory.
    pub fn inference(&self, image: &DynamicImage, tile: Option<usize>) -> Result<DynamicImage> {
        let input = image_to_tensor(image, &self.device)?;
        let (_, _, h, w) = input.dims4()?;

        let output = match tile {
            Some(tile) if tile < h.max(w) => self.forward_tiled(&input, tile)?,
            _ => self.model.forward(&input)?,
        };

        tensor_to_image(&output)
    }

    fn forward_tiled(&self, input: &Tensor, tile: usize) -> Result<Tensor> {
        let scale = self.model.scale() as usize;
        let (_, _, h, w) = input.dims4()?;

        let mut rows = Vec::new();
        for (y, tile_h, crop_y, keep_h) in tile_spans(h, tile, TILE_OVERLAP) {
            let mut cols = Vec::new();
            for (x, tile_w, crop_x, keep_w) in tile_spans(w, tile, TILE_OVERLAP) {
                let patch = input.narrow(2, y, tile_h)?.narrow(3, x, tile_w)?;
                let out = self.model.forward(&patch)?;
                let out = out
                    .narrow(2, crop_y * scale, keep_h * scale)?
                    .narrow(3, crop_x * scale, keep_w * scale)?;
                cols.push(out);
            }
            rows.push(Tensor::cat(&cols, 3)?);
        }
        Ok(Tensor::cat(&rows, 2)?)
    }
}

/// Split `len` into tile windows of at most `tile` pixels, each extended by
/// `overlap` context on interior edges. Yields `(start, len, crop, keep)`:
/// the input window and the portion of its output that survives stitching.
/// The `keep` spans partition `0..len` exactly.
fn tile_spans(len: usize, tile: usize, overlap: usize) -> Vec<(usize, usize, usize, usize)> {
    let tile = tile.max(overlap * 2 + 1);
    let mut spans = Vec::new();
    let mut pos = 0;
    while pos < len {
        let keep = tile.min(len - pos);
        let start = pos.saturating_sub(overlap);
        let end = (pos + keep + overlap).min(len);
        spans.push((start, end - start, pos - start, keep));
        pos += keep;
    }
    spans
}
