// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Utc};
use image::RgbImage;
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{Render, TrackReport, draw::Record},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("帧计数锁已损坏")]
  Poisoned,
}

/// 按日期分目录保存标注帧，并在同名 `.txt` 中记录跟踪结果
///
/// 默认只保存本帧有检测的帧，`?always` 时保存所有帧。
pub struct DirectoryRecordOutput<const W: u32, const H: u32> {
  directory: PathBuf,
  frame_counter: Mutex<u16>,
  always: bool,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for DirectoryRecordOutput<W, H> {
  const SCHEME: &'static str = "folder";
}

impl<const W: u32, const H: u32> FromUrl for DirectoryRecordOutput<W, H> {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      frame_counter: Mutex::new(0),
      always,
    })
  }
}

fn dated_path(directory: &Path, now: DateTime<Utc>, id: u16) -> PathBuf {
  directory
    .join(now.year().to_string())
    .join(format!("{:02}", now.month()))
    .join(format!("{:02}", now.day()))
    .join(format!("{}-{:04X}.png", now.format("%H-%M-%S"), id))
}

impl<const W: u32, const H: u32> DirectoryRecordOutput<W, H> {
  fn frame_id(&self) -> Result<u16, DirectoryRecordOutputError> {
    let mut counter = self
      .frame_counter
      .lock()
      .map_err(|_| DirectoryRecordOutputError::Poisoned)?;
    *counter = counter.wrapping_add(1);
    Ok(*counter)
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let path = dated_path(&self.directory, Utc::now(), self.frame_id()?);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    Ok(path)
  }
}

impl<const W: u32, const H: u32> Render<RgbImage, TrackReport> for DirectoryRecordOutput<W, H> {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &RgbImage, result: &TrackReport) -> Result<(), Self::Error> {
    if !(self.always || result.state.detected) {
      return Ok(());
    }

    let path = self.frame_path()?;
    frame.save(&path)?;
    Record::record(result, &path)?;
    debug!("帧 #{} 已记录到 {}", result.frame_index, path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;
  use crate::{
    protocol::CoordinateEncoder,
    track::{PixelPoint, TrackState},
  };

  fn report(detected: bool) -> TrackReport {
    let state = TrackState {
      point: PixelPoint::new(160, 360),
      detected,
    };
    TrackReport {
      frame_index: 3,
      state,
      message: CoordinateEncoder::default().encode(&state),
    }
  }

  fn files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
      let Ok(entries) = std::fs::read_dir(&dir) else {
        continue;
      };
      for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
          stack.push(path);
        } else {
          found.push(path);
        }
      }
    }
    found
  }

  #[test]
  fn dated_path_layout() {
    let now = Utc.with_ymd_and_hms(2026, 3, 7, 9, 5, 1).unwrap();
    assert_eq!(
      dated_path(Path::new("/rec"), now, 0x1f),
      PathBuf::from("/rec/2026/03/07/09-05-01-001F.png")
    );
  }

  #[test]
  fn records_only_detected_frames_by_default() {
    let dir = std::env::temp_dir().join(format!("zhuiguang-folder-{}", std::process::id()));
    let url = url::Url::parse(&format!("folder://{}", dir.display())).unwrap();
    let output = DirectoryRecordOutput::<8, 4>::from_url(&url).unwrap();
    let image = RgbImage::new(8, 4);

    output.render_result(&image, &report(false)).unwrap();
    assert!(files(&dir).is_empty());

    output.render_result(&image, &report(true)).unwrap();
    let found = files(&dir);
    assert_eq!(found.len(), 2);
    let txt = found
      .iter()
      .find(|p| p.extension().is_some_and(|e| e == "txt"))
      .unwrap();
    assert_eq!(std::fs::read_to_string(txt).unwrap(), "3, 160360, 1, 160, 360");

    std::fs::remove_dir_all(dir).unwrap();
  }

  #[test]
  fn always_records_every_frame() {
    let dir = std::env::temp_dir().join(format!("zhuiguang-always-{}", std::process::id()));
    let url = url::Url::parse(&format!("folder://{}?always", dir.display())).unwrap();
    let output = DirectoryRecordOutput::<8, 4>::from_url(&url).unwrap();

    output
      .render_result(&RgbImage::new(8, 4), &report(false))
      .unwrap();
    assert_eq!(files(&dir).len(), 2);

    std::fs::remove_dir_all(dir).unwrap();
  }
}
