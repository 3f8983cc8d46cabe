// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/input/v4l_input.rs - V4L2 摄像头输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::pin::Pin;

use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use crate::{FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame};

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("Invalid camera index: {0}")]
  InvalidIndex(String),
  #[error("V4L error on {0}: {1}")]
  V4lError(String, std::io::Error),
  #[error("Unsupported pixel format: {0}")]
  UnsupportedPixelFormat(String),
}

const V4L_BUFFER_COUNT: u32 = 4;
const DEFAULT_DEVICE: &str = "/dev/video0";

/// 根据 URL 解析设备路径
///
/// - `v4l:///dev/video2` 直接使用路径
/// - `v4l:///?index=2` 使用摄像头序号，映射到 `/dev/video2`
pub fn device_path_from_url(url: &Url) -> Result<String, V4lInputError> {
  if let Some((_, index)) = url.query_pairs().find(|(k, _)| k == "index") {
    let index: u32 = index
      .parse()
      .map_err(|_| V4lInputError::InvalidIndex(index.to_string()))?;
    return Ok(format!("/dev/video{}", index));
  }

  match url.path() {
    "" | "/" => Ok(DEFAULT_DEVICE.to_string()),
    path => Ok(path.to_string()),
  }
}

/// V4L2 摄像头输入
///
/// v4l 的 Stream 需要引用 Device，Device 用 Pin<Box> 固定在堆上，
/// Stream 在 drop 时先于 Device 释放。
pub struct V4lInput<const W: u32, const H: u32> {
  device: Pin<Box<Device>>,
  stream: Option<Stream<'static>>,
  device_path: String,
  width: u32,
  height: u32,
  stride: u32,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for V4lInput<W, H> {
  const SCHEME: &'static str = "v4l";
}

impl<const W: u32, const H: u32> FromUrl for V4lInput<W, H> {
  type Error = V4lInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4lInputError::SchemaMismatch);
    }

    let device_path = device_path_from_url(url)?;
    Self::open(&device_path)
  }
}

impl<const W: u32, const H: u32> V4lInput<W, H> {
  pub fn open(device_path: &str) -> Result<Self, V4lInputError> {
    let v4l_err = |e| V4lInputError::V4lError(device_path.to_string(), e);

    let device = Box::pin(Device::with_path(device_path).map_err(v4l_err)?);

    let mut format = device.format().map_err(v4l_err)?;
    format.width = W;
    format.height = H;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format).map_err(v4l_err)?;

    if format.fourcc != FourCC::new(b"YUYV") {
      return Err(V4lInputError::UnsupportedPixelFormat(
        format.fourcc.to_string(),
      ));
    }
    if format.width != W || format.height != H {
      warn!(
        "摄像头不支持 {}x{}, 实际 {}x{}, 将缩放",
        W, H, format.width, format.height
      );
    }

    let mut input = Self {
      device,
      stream: None,
      device_path: device_path.to_string(),
      width: format.width,
      height: format.height,
      stride: format.stride,
    };

    // SAFETY: device 被 Pin<Box> 固定，不会移动；stream 在 Drop 中先于 device 释放
    let device_ref: &Device = &input.device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, V4L_BUFFER_COUNT).map_err(v4l_err)?
    };
    input.stream = Some(stream);

    info!(
      "V4L2 摄像头已打开: {} ({}x{}, 行宽 {} 字节)",
      input.device_path, input.width, input.height, input.stride
    );
    Ok(input)
  }
}

/// 将 YUYV 格式转换为 RGB
///
/// 每行 `stride` 字节，行尾可能带有对齐填充；`stride` 为 0 时按紧密排列处理。
/// 缓冲区不足 `height` 行时返回 `None`。
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32, stride: u32) -> Option<Vec<u8>> {
  let row_bytes = width as usize * 2;
  let stride = (stride as usize).max(row_bytes);
  let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);

  for row in 0..height as usize {
    let start = row * stride;
    let line = yuyv.get(start..start + row_bytes)?;

    for chunk in line.chunks_exact(4) {
      let y0 = chunk[0] as f32;
      let u = chunk[1] as f32 - 128.0;
      let y1 = chunk[2] as f32;
      let v = chunk[3] as f32 - 128.0;

      for y in [y0, y1] {
        let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
        let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
        let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
        rgb.extend_from_slice(&[r, g, b]);
      }
    }
  }

  Some(rgb)
}

impl<const W: u32, const H: u32> Drop for V4lInput<W, H> {
  fn drop(&mut self) {
    self.stream.take();
    info!("V4L2 摄像头已释放: {}", self.device_path);
  }
}

impl<const W: u32, const H: u32> Iterator for V4lInput<W, H> {
  type Item = RgbNhwcFrame<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    let stream = self.stream.as_mut()?;

    let buffer = match stream.next() {
      Ok((buffer, _meta)) => buffer,
      Err(e) => {
        error!("无法捕获帧: {}", e);
        return None;
      }
    };

    let rgb_data = yuyv_to_rgb(buffer, self.width, self.height, self.stride);
    match rgb_data.and_then(|data| RgbImage::from_raw(self.width, self.height, data)) {
      Some(image) => Some(RgbNhwcFrame::from_rgb_image(&image)),
      None => {
        error!("捕获的缓冲区大小与 {}x{} 不匹配", self.width, self.height);
        None
      }
    }
  }
}
