// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 单张图像输入，只产出一帧
pub struct ImageFileInput<const W: u32, const H: u32> {
  image: Option<RgbImage>,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for ImageFileInput<W, H> {
  const SCHEME: &'static str = "image";
}

impl<const W: u32, const H: u32> FromUrl for ImageFileInput<W, H> {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let path = url.path();
    let image = ImageReader::open(path)?.decode()?;
    info!("读取图像文件: {} ({}x{})", path, image.width(), image.height());

    Ok(ImageFileInput {
      image: Some(image.into_rgb8()),
    })
  }
}

impl<const W: u32, const H: u32> ImageFileInput<W, H> {
  pub fn into_nhwc(self) -> ImageFileInputNhwc<W, H> {
    ImageFileInputNhwc { inner: self }
  }
}

pub struct ImageFileInputNhwc<const W: u32, const H: u32> {
  inner: ImageFileInput<W, H>,
}

impl<const W: u32, const H: u32> Iterator for ImageFileInputNhwc<W, H> {
  type Item = RgbNhwcFrame<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    self
      .inner
      .image
      .take()
      .map(|image| RgbNhwcFrame::from_rgb_image(&image))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn yields_exactly_one_resized_frame() {
    let path = std::env::temp_dir().join(format!("zhuiguang-input-{}.png", std::process::id()));
    RgbImage::from_pixel(16, 8, Rgb([1, 2, 3]))
      .save(&path)
      .unwrap();

    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let mut frames = ImageFileInput::<8, 4>::from_url(&url).unwrap().into_nhwc();

    let frame = frames.next().unwrap();
    assert_eq!(frame.to_rgb_image().get_pixel(0, 0), &Rgb([1, 2, 3]));
    assert!(frames.next().is_none());

    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn rejects_other_schemes() {
    let url = Url::parse("gst://camera/dev/video0").unwrap();
    assert!(matches!(
      ImageFileInput::<8, 4>::from_url(&url),
      Err(ImageFileInputError::SchemaMismatch)
    ));
  }
}
