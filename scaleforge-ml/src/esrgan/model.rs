use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder, conv2d, ops};

const GROWTH_CHANNELS: usize = 32;
const RESIDUAL_SCALE: f64 = 0.2;
const LEAKY_SLOPE: f64 = 0.2;

fn conv3x3(vb: VarBuilder, in_channels: usize, out_channels: usize) -> Result<Conv2d> {
    Ok(conv2d(
        in_channels,
        out_channels,
        3,
        Conv2dConfig {
            padding: 1,
            ..Default::default()
        },
        vb,
    )?)
}

/// Five densely connected convolutions; each layer sees the concatenation
/// of the block input and every previous layer's output.
struct ResidualDenseBlock {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    conv4: Conv2d,
    conv5: Conv2d,
}

impl ResidualDenseBlock {
    fn load(vb: &VarBuilder, num_feat: usize) -> Result<Self> {
        let gc = GROWTH_CHANNELS;
        Ok(Self {
            conv1: conv3x3(vb.pp("conv1"), num_feat, gc)?,
            conv2: conv3x3(vb.pp("conv2"), num_feat + gc, gc)?,
            conv3: conv3x3(vb.pp("conv3"), num_feat + 2 * gc, gc)?,
            conv4: conv3x3(vb.pp("conv4"), num_feat + 3 * gc, gc)?,
            conv5: conv3x3(vb.pp("conv5"), num_feat + 4 * gc, num_feat)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let x1 = ops::leaky_relu(&self.conv1.forward(xs)?, LEAKY_SLOPE)?;
        let x2 = ops::leaky_relu(
            &self.conv2.forward(&Tensor::cat(&[xs, &x1], 1)?)?,
            LEAKY_SLOPE,
        )?;
        let x3 = ops::leaky_relu(
            &self.conv3.forward(&Tensor::cat(&[xs, &x1, &x2], 1)?)?,
            LEAKY_SLOPE,
        )?;
        let x4 = ops::leaky_relu(
            &self.conv4.forward(&Tensor::cat(&[xs, &x1, &x2, &x3], 1)?)?,
            LEAKY_SLOPE,
        )?;
        let x5 = self.conv5.forward(&Tensor::cat(&[xs, &x1, &x2, &x3, &x4], 1)?)?;
        Ok(((x5 * RESIDUAL_SCALE)? + xs)?)
    }
}

/// Residual-in-residual dense block: three RDBs with an outer residual.
struct Rrdb {
    rdb1: ResidualDenseBlock,
    rdb2: ResidualDenseBlock,
    rdb3: ResidualDenseBlock,
}

impl Rrdb {
    fn load(vb: &VarBuilder, num_feat: usize) -> Result<Self> {
        Ok(Self {
            rdb1: ResidualDenseBlock::load(&vb.pp("rdb1"), num_feat)?,
            rdb2: ResidualDenseBlock::load(&vb.pp("rdb2"), num_feat)?,
            rdb3: ResidualDenseBlock::load(&vb.pp("rdb3"), num_feat)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = self.rdb1.forward(xs)?;
        let out = self.rdb2.forward(&out)?;
        let out = self.rdb3.forward(&out)?;
        Ok(((out * RESIDUAL_SCALE)? + xs)?)
    }
}

/// RRDBNet generator as published for Real-ESRGAN: shallow feature
/// extraction, a trunk of RRDBs, then two nearest-neighbor upsample stages
/// for the native x4 output.
pub struct RrdbNet {
    conv_first: Conv2d,
    body: Vec<Rrdb>,
    conv_body: Conv2d,
    conv_up1: Conv2d,
    conv_up2: Conv2d,
    conv_hr: Conv2d,
    conv_last: Conv2d,
    scale: u32,
}

impl RrdbNet {
    pub fn load(vb: &VarBuilder, num_feat: usize, num_block: usize, scale: u32) -> Result<Self> {
        anyhow::ensure!(scale == 4, "only x4 weights are published, got x{scale}");

        let body = (0..num_block)
            .map(|i| Rrdb::load(&vb.pp(format!("body.{i}")), num_feat))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            conv_first: conv3x3(vb.pp("conv_first"), 3, num_feat)?,
            body,
            conv_body: conv3x3(vb.pp("conv_body"), num_feat, num_feat)?,
            conv_up1: conv3x3(vb.pp("conv_up1"), num_feat, num_feat)?,
            conv_up2: conv3x3(vb.pp("conv_up2"), num_feat, num_feat)?,
            conv_hr: conv3x3(vb.pp("conv_hr"), num_feat, num_feat)?,
            conv_last: conv3x3(vb.pp("conv_last"), num_feat, 3)?,
            scale,
        })
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let feat = self.conv_first.forward(xs)?;

        let mut trunk = feat.clone();
        for block in &self.body {
            trunk = block.forward(&trunk)?;
        }
        let feat = (feat + self.conv_body.forward(&trunk)?)?;

        let (_, _, h, w) = feat.dims4()?;
        let feat = feat.upsample_nearest2d(h * 2, w * 2)?;
        let feat = ops::leaky_relu(&self.conv_up1.forward(&feat)?, LEAKY_SLOPE)?;
        let (_, _, h, w) = feat.dims4()?;
        let feat = feat.upsample_nearest2d(h * 2, w * 2)?;
        let feat = ops::leaky_relu(&self.conv_up2.forward(&feat)?, LEAKY_SLOPE)?;

        let feat = ops::leaky_relu(&self.conv_hr.forward(&feat)?, LEAKY_SLOPE)?;
        Ok(self.conv_last.forward(&feat)?)
    }
}
