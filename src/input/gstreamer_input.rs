// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频输入模块
//!
//! 支持两类来源，均通过 `gst://` 方案的 URL 描述：
//!
//! - `gst://camera/dev/video2?width=640&height=480&fps=30&format=YUY2` 摄像头（V4L2）
//! - `gst://file/path/to/video.mp4` 视频文件
//!
//! 无论来源尺寸如何，管道末端都会缩放并转换为 `W×H` 的 RGB 帧。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## 基本用法
//!
//! ```no_run
//! use zhuiguang::{FromUrl, input::GStreamerInputPipelineBuilder};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("gst://camera/dev/video2?fps=30")?;
//! let input = GStreamerInputPipelineBuilder::<640, 480>::from_url(&url)?.build()?;
//!
//! for frame in input.into_nhwc() {
//!     println!("处理帧: {}x{}", frame.width(), frame.height());
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use crate::{FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// URI scheme 不匹配（期望 "gst://"）
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  /// URI 主机部分既不是 camera 也不是 file
  #[error("Unknown source kind: {0}")]
  UnknownSource(String),
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  #[error("Unsupported video format")]
  UnsupportedFormat,
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GStreamerInputBuilderItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    format: Option<String>,
    width: u32,
    height: u32,
    fps: u32,
  },
  Scale {
    width: u32,
    height: u32,
  },
  TargetFormat {
    format: String,
  },
  VideoFlip {
    method: u32,
  },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location={} ! decodebin", path)
      }
      GStreamerInputBuilderItem::CameraSource {
        camera,
        io_mode,
        format,
        width,
        height,
        fps,
      } => {
        let io_mode_str = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        let format_str = format
          .as_ref()
          .map(|f| format!(",format={}", f))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! video/x-raw{},width={},height={},framerate={}/1",
          camera, io_mode_str, format_str, width, height, fps
        )
      }
      GStreamerInputBuilderItem::Scale { width, height } => {
        format!(
          "videoscale ! video/x-raw,width={},height={}",
          width, height
        )
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
      GStreamerInputBuilderItem::VideoFlip { method } => {
        format!("videoflip method={}", method)
      }
    }
  }
}

/// GStreamer 输入管道构建器
pub struct GStreamerInputPipelineBuilder<const W: u32, const H: u32> {
  items: Vec<GStreamerInputBuilderItem>,
}

impl<const W: u32, const H: u32> GStreamerInputPipelineBuilder<W, H> {
  fn build_camera_pipeline(path: &str, query: &HashMap<String, String>) -> Self {
    let parse = |key: &str| query.get(key).and_then(|v| v.parse::<u32>().ok());

    let mut items = vec![GStreamerInputBuilderItem::CameraSource {
      camera: path.to_string(),
      io_mode: parse("io-mode"),
      format: query.get("format").cloned(),
      width: parse("width").unwrap_or(W),
      height: parse("height").unwrap_or(H),
      fps: parse("fps").unwrap_or(30),
    }];

    if let Some(video_flip) = Self::video_flip(query.get("rotate").map(|s| s.as_ref())) {
      items.push(video_flip);
    }

    GStreamerInputPipelineBuilder { items }
  }

  fn build_file_pipeline(path: &str, query: &HashMap<String, String>) -> Self {
    let mut items = vec![GStreamerInputBuilderItem::FileSource(path.to_string())];

    if let Some(video_flip) = Self::video_flip(query.get("rotate").map(|s| s.as_ref())) {
      items.push(video_flip);
    }

    GStreamerInputPipelineBuilder { items }
  }

  fn video_flip(rotate: Option<&str>) -> Option<GStreamerInputBuilderItem> {
    let method = match rotate? {
      "90" => 1,
      "180" => 2,
      "270" => 3,
      "0" => return None,
      other => {
        warn!("不支持的旋转角度: {}, 忽略", other);
        return None;
      }
    };
    Some(GStreamerInputBuilderItem::VideoFlip { method })
  }

  pub fn items(&self) -> &[GStreamerInputBuilderItem] {
    &self.items
  }

  pub fn pipeline_description(&self) -> String {
    let basic_pipeline = self
      .items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    format!(
      "{} ! appsink max-buffers=2 drop=true name=sink",
      basic_pipeline
    )
  }

  pub fn build(self) -> Result<GStreamerInput<W, H>, GStreamerInputError> {
    gst::init()?;

    let full_pipeline = self.pipeline_description();
    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerInput { pipeline, appsink })
  }
}

impl<const W: u32, const H: u32> FromUrlWithScheme for GStreamerInputPipelineBuilder<W, H> {
  const SCHEME: &'static str = "gst";
}

impl<const W: u32, const H: u32> FromUrl for GStreamerInputPipelineBuilder<W, H> {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let mut builder = match url.host_str() {
      Some("camera") => Self::build_camera_pipeline(url.path(), &query),
      Some("file") => Self::build_file_pipeline(url.path(), &query),
      other => {
        return Err(GStreamerInputError::UnknownSource(
          other.unwrap_or_default().to_string(),
        ));
      }
    };

    builder.items.push(GStreamerInputBuilderItem::Scale {
      width: W,
      height: H,
    });
    builder.items.push(GStreamerInputBuilderItem::TargetFormat {
      format: "RGB".to_string(),
    });

    Ok(builder)
  }
}

/// GStreamer 视频输入
///
/// 管理 GStreamer 管道和 appsink，在 drop 时将管道置为 Null。
pub struct GStreamerInput<const W: u32, const H: u32> {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
}

impl<const W: u32, const H: u32> Drop for GStreamerInput<W, H> {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    } else {
      info!("GStreamer 输入已释放");
    }
  }
}

impl<const W: u32, const H: u32> GStreamerInput<W, H> {
  pub fn into_nhwc(self) -> GStreamerInputNhwc<W, H> {
    GStreamerInputNhwc { inner: self }
  }

  fn pull_sample(&self) -> Option<gst::Sample> {
    self
      .appsink
      .pull_sample()
      .map_err(|e| {
        error!("Failed to pull sample: {}", e);
        e
      })
      .ok()
  }
}

/// GStreamer 输入的 NHWC 格式迭代器
pub struct GStreamerInputNhwc<const W: u32, const H: u32> {
  inner: GStreamerInput<W, H>,
}

impl<const W: u32, const H: u32> Iterator for GStreamerInputNhwc<W, H> {
  type Item = RgbNhwcFrame<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    let sample = self.inner.pull_sample()?;
    convert_sample_to_nhwc(sample)
      .map_err(|e| {
        error!("Failed to fetch sample: {}", e);
        e
      })
      .ok()
  }
}

fn convert_sample_to_nhwc<const W: u32, const H: u32>(
  sample: gst::Sample,
) -> Result<RgbNhwcFrame<W, H>, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  // 行可能带有对齐填充
  let stride = video_info.stride()[0] as usize;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  if width != W as usize || height != H as usize {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected: RgbNhwcFrame::<W, H>::BYTES,
      actual: width * height * 3,
    });
  }

  let expected_size = stride * (height - 1) + width * 3;
  if data.len() < expected_size {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected: expected_size,
      actual: data.len(),
    });
  }

  let mut frame = RgbNhwcFrame::<W, H>::default();
  let frame_slice = frame.as_mut();
  let row_bytes = width * 3;

  match video_info.format() {
    gst_video::VideoFormat::Rgb => {
      for h in 0..height {
        let src = &data[h * stride..h * stride + row_bytes];
        frame_slice[h * row_bytes..(h + 1) * row_bytes].copy_from_slice(src);
      }
    }
    gst_video::VideoFormat::Bgr => {
      for h in 0..height {
        for w in 0..width {
          for c in 0..3 {
            let src_idx = h * stride + w * 3 + (2 - c);
            let dst_idx = (h * width + w) * 3 + c;
            frame_slice[dst_idx] = data[src_idx];
          }
        }
      }
    }
    _ => return Err(GStreamerInputError::UnsupportedFormat),
  }

  Ok(frame)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn camera_url_builds_scaled_rgb_pipeline() {
    let url = Url::parse("gst://camera/dev/video2?width=1280&height=720&fps=15&rotate=180").unwrap();
    let builder = GStreamerInputPipelineBuilder::<640, 480>::from_url(&url).unwrap();

    assert_eq!(
      builder.items()[0],
      GStreamerInputBuilderItem::CameraSource {
        camera: "/dev/video2".to_string(),
        io_mode: None,
        format: None,
        width: 1280,
        height: 720,
        fps: 15,
      }
    );
    assert_eq!(
      builder.pipeline_description(),
      "v4l2src device=/dev/video2 ! video/x-raw,width=1280,height=720,framerate=15/1 \
       ! videoflip method=2 \
       ! videoscale ! video/x-raw,width=640,height=480 \
       ! videoconvert ! video/x-raw,format=RGB \
       ! appsink max-buffers=2 drop=true name=sink"
    );
  }

  #[test]
  fn camera_defaults_to_frame_size() {
    let url = Url::parse("gst://camera/dev/video0?format=YUY2").unwrap();
    let builder = GStreamerInputPipelineBuilder::<640, 480>::from_url(&url).unwrap();
    assert!(builder.pipeline_description().starts_with(
      "v4l2src device=/dev/video0 ! video/x-raw,format=YUY2,width=640,height=480,framerate=30/1"
    ));
  }

  #[test]
  fn file_url_decodes() {
    let url = Url::parse("gst://file/tmp/clip.mp4").unwrap();
    let builder = GStreamerInputPipelineBuilder::<640, 480>::from_url(&url).unwrap();
    assert!(
      builder
        .pipeline_description()
        .starts_with("filesrc location=/tmp/clip.mp4 ! decodebin ! videoscale")
    );
  }

  #[test]
  fn rejects_unknown_sources() {
    let url = Url::parse("gst://rtsp/stream").unwrap();
    assert!(matches!(
      GStreamerInputPipelineBuilder::<640, 480>::from_url(&url),
      Err(GStreamerInputError::UnknownSource(kind)) if kind == "rtsp"
    ));
  }
}
