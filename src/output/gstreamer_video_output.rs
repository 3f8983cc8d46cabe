// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频文件输出
//!
//! 将标注后的帧编码写入视频文件，容器由文件扩展名决定：
//!
//! - **AVI** (Motion JPEG)
//! - **MP4** (H.264)
//! - **MKV** (H.264)
//!
//! 其他扩展名按 AVI 处理。
//!
//! ## URL 格式
//!
//! `gstvideo:output.avi?fps=10`
//!
//! 不带 `//` 时路径相对于当前目录，`gstvideo:///tmp/output.avi` 为绝对路径。
//!
//! - `fps`: 帧率（帧/秒），默认 10
//!
//! 帧尺寸由类型参数 `W`、`H` 决定。

use std::sync::Mutex;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{Render, TrackReport},
};

const DEFAULT_FPS: i32 = 10;
const NANOS_PER_SECOND: u64 = 1_000_000_000;

#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("参数错误: {0}={1}")]
  InvalidParameter(String, String),
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 布尔错误: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("无法获取 appsrc 元素")]
  AppSrcNotFound,
  #[error("无法将元素转换为 appsrc")]
  AppSrcConversionFailed,
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("状态改变错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("缓冲区创建错误")]
  BufferCreationError,
  #[error("帧尺寸不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  FrameSize {
    expected: (u32, u32),
    actual: (u32, u32),
  },
  #[error("帧计数锁已损坏")]
  Poisoned,
}

/// 根据文件扩展名生成编码管道描述
pub fn pipeline_description(file_path: &str) -> String {
  let encoder = if file_path.ends_with(".mp4") {
    "video/x-raw,format=I420 ! x264enc speed-preset=fast tune=zerolatency ! h264parse ! mp4mux"
  } else if file_path.ends_with(".mkv") {
    "video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux"
  } else {
    "jpegenc ! avimux"
  };

  format!(
    "appsrc name=src ! videoconvert ! {} ! filesink location={}",
    encoder, file_path
  )
}

/// 视频文件路径与帧率
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoOutputConfig {
  pub path: String,
  pub fps: i32,
}

impl VideoOutputConfig {
  pub fn from_url(url: &Url) -> Result<Self, GStreamerVideoOutputError> {
    let mut fps = DEFAULT_FPS;
    for (k, v) in url.query_pairs() {
      if k == "fps" {
        fps = v
          .parse()
          .ok()
          .filter(|fps: &i32| *fps > 0)
          .ok_or_else(|| GStreamerVideoOutputError::InvalidParameter(k.to_string(), v.to_string()))?;
      }
    }

    Ok(VideoOutputConfig {
      path: url.path().to_string(),
      fps,
    })
  }

  pub fn pipeline_description(&self) -> String {
    pipeline_description(&self.path)
  }
}

pub struct GStreamerVideoOutput<const W: u32, const H: u32> {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  fps: i32,
  frame_count: Mutex<u64>,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for GStreamerVideoOutput<W, H> {
  const SCHEME: &'static str = "gstvideo";
}

impl<const W: u32, const H: u32> FromUrl for GStreamerVideoOutput<W, H> {
  type Error = GStreamerVideoOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(GStreamerVideoOutputError::SchemeMismatch);
    }

    let config = VideoOutputConfig::from_url(url)?;
    gst::init()?;

    let fps = config.fps;
    let file_path = config.path.as_str();
    let pipeline_desc = config.pipeline_description();
    info!("创建视频输出管道: {}", pipeline_desc);

    let pipeline = gst::parse::launch(&pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerVideoOutputError::PipelineError("无法创建管道".to_string()))?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcConversionFailed)?;

    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", W as i32)
      .field("height", H as i32)
      .field("framerate", gst::Fraction::new(fps, 1))
      .build();

    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);

    pipeline.set_state(gst::State::Playing)?;

    info!("视频输出已启动: {}x{} @ {} fps -> {}", W, H, fps, file_path);

    Ok(GStreamerVideoOutput {
      pipeline,
      appsrc,
      fps,
      frame_count: Mutex::new(0),
    })
  }
}

impl<const W: u32, const H: u32> Drop for GStreamerVideoOutput<W, H> {
  fn drop(&mut self) {
    if let Err(e) = self.appsrc.end_of_stream() {
      warn!("无法发送 EOS: {:?}", e);
    }

    // 等待 EOS 到达 filesink，否则容器尾部不完整
    if let Some(bus) = self.pipeline.bus() {
      let _ = bus.timed_pop_filtered(
        gst::ClockTime::from_seconds(5),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      );
    }

    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("无法停止视频输出管道: {}", e);
    }

    let frame_count = self
      .frame_count
      .lock()
      .map(|count| *count)
      .unwrap_or_else(|poisoned| *poisoned.into_inner());
    info!("视频输出已关闭, 共写入 {} 帧", frame_count);
  }
}

impl<const W: u32, const H: u32> GStreamerVideoOutput<W, H> {
  fn push_frame(&self, image: &RgbImage) -> Result<(), GStreamerVideoOutputError> {
    if image.dimensions() != (W, H) {
      return Err(GStreamerVideoOutputError::FrameSize {
        expected: (W, H),
        actual: image.dimensions(),
      });
    }

    let data = image.as_raw();
    let mut buffer = gst::Buffer::with_size(data.len())
      .map_err(|_| GStreamerVideoOutputError::BufferCreationError)?;

    let mut frame_count = self
      .frame_count
      .lock()
      .map_err(|_| GStreamerVideoOutputError::Poisoned)?;
    let duration = NANOS_PER_SECOND / self.fps as u64;
    let timestamp = *frame_count * duration;

    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or(GStreamerVideoOutputError::BufferCreationError)?;
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(timestamp));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(duration));

      let mut buffer_map = buffer_ref
        .map_writable()
        .map_err(|_| GStreamerVideoOutputError::PipelineError("无法映射缓冲区".to_string()))?;
      buffer_map.copy_from_slice(data);
    }

    self
      .appsrc
      .push_buffer(buffer)
      .map_err(|e| GStreamerVideoOutputError::PipelineError(format!("无法推送缓冲区: {:?}", e)))?;

    *frame_count += 1;
    debug!("视频帧 #{} 已写入", *frame_count);
    Ok(())
  }
}

impl<const W: u32, const H: u32> Render<RgbImage, TrackReport> for GStreamerVideoOutput<W, H> {
  type Error = GStreamerVideoOutputError;

  fn render_result(&self, frame: &RgbImage, _result: &TrackReport) -> Result<(), Self::Error> {
    self.push_frame(frame)
  }
}
