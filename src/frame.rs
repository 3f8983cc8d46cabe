// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/frame.rs - NHWC 帧定义
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use image::{ImageBuffer, Rgb, RgbImage, imageops::FilterType};
use thiserror::Error;

use crate::input::AsNhwcFrame;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
#[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
pub struct FrameSizeError {
  pub expected: usize,
  pub actual: usize,
}

/// 固定尺寸的 RGB 帧，按 HWC 顺序存储
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbNhwcFrame<const W: u32, const H: u32> {
  data: Box<[u8]>,
}

impl<const W: u32, const H: u32> RgbNhwcFrame<W, H> {
  pub const BYTES: usize = RGB_CHANNELS * W as usize * H as usize;

  pub fn height(&self) -> usize {
    H as usize
  }

  pub fn width(&self) -> usize {
    W as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    // 长度在构造时已校验
    ImageBuffer::from_fn(W, H, |x, y| {
      let idx = (y as usize * W as usize + x as usize) * RGB_CHANNELS;
      Rgb([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    })
  }

  /// 从任意尺寸的图像构造帧，尺寸不一致时缩放到 W×H
  pub fn from_rgb_image(image: &RgbImage) -> Self {
    let data = if image.dimensions() == (W, H) {
      image.as_raw().clone()
    } else {
      image::imageops::resize(image, W, H, FilterType::Triangle).into_raw()
    };

    Self {
      data: data.into_boxed_slice(),
    }
  }
}

impl<const W: u32, const H: u32> TryFrom<Vec<u8>> for RgbNhwcFrame<W, H> {
  type Error = FrameSizeError;

  fn try_from(data: Vec<u8>) -> Result<Self, Self::Error> {
    if data.len() != Self::BYTES {
      return Err(FrameSizeError {
        expected: Self::BYTES,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
    })
  }
}

impl<const W: u32, const H: u32> Default for RgbNhwcFrame<W, H> {
  fn default() -> Self {
    let data = vec![0u8; Self::BYTES].into_boxed_slice();
    Self { data }
  }
}

impl<const W: u32, const H: u32> AsMut<[u8]> for RgbNhwcFrame<W, H> {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl<const W: u32, const H: u32> AsNhwcFrame<W, H> for RgbNhwcFrame<W, H> {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}
