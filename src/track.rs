// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/track.rs - 关键点提取与跟踪状态
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::str::FromStr;

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  frame::RgbNhwcFrame,
  model::{FaceDetectResult, Keypoint},
  output::draw::Marker,
};

/// 归一化坐标在边界处允许的误差
pub const NORMALIZED_TOLERANCE: f32 = 1e-6;

/// 默认跟踪的关键点（鼻尖）
pub const DEFAULT_KEYPOINT_INDEX: usize = 2;

/// 像素坐标
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PixelPoint {
  pub x: u32,
  pub y: u32,
}

impl PixelPoint {
  pub const fn new(x: u32, y: u32) -> Self {
    Self { x, y }
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("像素坐标格式应为 X,Y: {0}")]
pub struct PixelPointParseError(String);

impl FromStr for PixelPoint {
  type Err = PixelPointParseError;

  /// 解析 `X,Y` 形式的坐标
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || PixelPointParseError(s.to_string());
    let (x, y) = s.split_once(',').ok_or_else(invalid)?;
    Ok(PixelPoint::new(
      x.trim().parse().map_err(|_| invalid())?,
      y.trim().parse().map_err(|_| invalid())?,
    ))
  }
}

fn is_valid_normalized(value: f32) -> bool {
  (value > 0.0 || value.abs() <= NORMALIZED_TOLERANCE)
    && (value < 1.0 || (value - 1.0).abs() <= NORMALIZED_TOLERANCE)
}

fn to_pixel(value: f32, dimension: u32) -> u32 {
  let px = (value * dimension as f32).floor();
  px.clamp(0.0, dimension.saturating_sub(1) as f32) as u32
}

/// 将归一化坐标转换为像素坐标
///
/// 任一分量不在 [0, 1] 内（含误差）时返回 `None`。结果总是落在
/// `[0, width-1] × [0, height-1]` 内。
pub fn normalized_to_pixel(x: f32, y: f32, width: u32, height: u32) -> Option<PixelPoint> {
  if !(is_valid_normalized(x) && is_valid_normalized(y)) {
    return None;
  }

  Some(PixelPoint::new(to_pixel(x, width), to_pixel(y, height)))
}

/// 跨帧的跟踪状态
///
/// `point` 是最近一次有效检测的位置，检测失败时保留旧值；
/// `detected` 表示本帧是否得到了新的有效位置，每帧结束时复位。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackState {
  pub point: PixelPoint,
  pub detected: bool,
}

impl TrackState {
  pub fn reset_flag(&mut self) {
    self.detected = false;
  }
}

/// 从检测结果中提取跟踪点并绘制标记
#[derive(Debug, Clone)]
pub struct Tracker {
  keypoint_index: usize,
  marker: Marker,
}

impl Default for Tracker {
  fn default() -> Self {
    Self::new(DEFAULT_KEYPOINT_INDEX)
  }
}

impl Tracker {
  pub fn new(keypoint_index: usize) -> Self {
    Self {
      keypoint_index,
      marker: Marker::default(),
    }
  }

  pub fn keypoint_index(&self) -> usize {
    self.keypoint_index
  }

  /// 只有单张人脸且其关键点有效时才更新 `state`，并在返回的帧副本上绘制标记；
  /// 其他情况下 `state` 不变，返回未修改的帧副本。
  pub fn observe<const W: u32, const H: u32>(
    &self,
    frame: &RgbNhwcFrame<W, H>,
    result: &FaceDetectResult,
    state: &mut TrackState,
  ) -> RgbImage {
    let mut annotated = frame.to_rgb_image();

    let detection = match result.items.as_ref() {
      [] => {
        debug!("未检测到人脸");
        return annotated;
      }
      [detection] => detection,
      items => {
        warn!("检测到 {} 张人脸, 跳过本帧", items.len());
        return annotated;
      }
    };

    let Some(&Keypoint { x, y }) = detection.keypoints.get(self.keypoint_index) else {
      warn!(
        "人脸只有 {} 个关键点, 缺少第 {} 个",
        detection.keypoints.len(),
        self.keypoint_index
      );
      return annotated;
    };

    let Some(point) = normalized_to_pixel(x, y, W, H) else {
      warn!("关键点 ({:.3}, {:.3}) 超出画面", x, y);
      return annotated;
    };

    state.point = point;
    state.detected = true;
    debug!("跟踪点更新为 ({}, {})", point.x, point.y);

    self.marker.draw(&mut annotated, point);
    annotated
  }
}

#[cfg(test)]
mod tests {
  use image::Rgb;

  use super::*;
  use crate::model::FaceDetection;

  fn face(keypoints: &[(f32, f32)]) -> FaceDetection {
    FaceDetection {
      score: 0.9,
      bbox: [0.1, 0.1, 0.9, 0.9],
      keypoints: keypoints.iter().map(|&(x, y)| Keypoint::new(x, y)).collect(),
    }
  }

  fn five_points(nose: (f32, f32)) -> Vec<(f32, f32)> {
    vec![(0.3, 0.3), (0.6, 0.3), nose, (0.35, 0.7), (0.65, 0.7)]
  }

  #[test]
  fn converts_inside_unit_square() {
    for &(x, y) in &[(0.0, 0.0), (0.5, 0.5), (0.999_9, 0.000_1), (1.0, 1.0), (0.25, 0.75)] {
      let p = normalized_to_pixel(x, y, 640, 480).unwrap();
      assert!(p.x <= 639 && p.y <= 479, "{:?} -> {:?}", (x, y), p);
    }
    assert_eq!(normalized_to_pixel(0.5, 0.5, 640, 480), Some(PixelPoint::new(320, 240)));
    assert_eq!(normalized_to_pixel(1.0, 1.0, 640, 480), Some(PixelPoint::new(639, 479)));
    assert_eq!(normalized_to_pixel(0.25, 0.75, 640, 480), Some(PixelPoint::new(160, 360)));
  }

  #[test]
  fn parses_point_arguments() {
    assert_eq!("160,120".parse(), Ok(PixelPoint::new(160, 120)));
    assert_eq!(" 5, 7".parse(), Ok(PixelPoint::new(5, 7)));
    assert!("160".parse::<PixelPoint>().is_err());
    assert!("a,1".parse::<PixelPoint>().is_err());
  }

  #[test]
  fn tolerates_boundary_rounding() {
    assert_eq!(normalized_to_pixel(-1e-7, 1.0 + 1e-7, 640, 480), Some(PixelPoint::new(0, 479)));
  }

  #[test]
  fn rejects_outside_unit_square() {
    assert_eq!(normalized_to_pixel(-0.01, 0.5, 640, 480), None);
    assert_eq!(normalized_to_pixel(0.5, 1.01, 640, 480), None);
    assert_eq!(normalized_to_pixel(f32::NAN, 0.5, 640, 480), None);
  }

  #[test]
  fn single_face_updates_state_and_draws_marker() {
    let frame = RgbNhwcFrame::<64, 48>::default();
    let result = FaceDetectResult::from(vec![face(&five_points((0.25, 0.5)))]);
    let mut state = TrackState::default();

    let annotated = Tracker::default().observe(&frame, &result, &mut state);

    assert_eq!(state, TrackState { point: PixelPoint::new(16, 24), detected: true });
    let marker = Marker::default();
    assert_eq!(annotated.get_pixel(16, 24), &Rgb(marker.line_color));
    assert_eq!(annotated.get_pixel(0, 24), &Rgb(marker.line_color));
    assert_eq!(annotated.get_pixel(16, 47), &Rgb(marker.line_color));
    assert_eq!(annotated.get_pixel(14, 22), &Rgb(marker.circle_color));
    assert_eq!(annotated.get_pixel(40, 10), &Rgb([0, 0, 0]));
  }

  #[test]
  fn multiple_faces_keep_stale_point() {
    let frame = RgbNhwcFrame::<64, 48>::default();
    let result = FaceDetectResult::from(vec![
      face(&five_points((0.25, 0.5))),
      face(&five_points((0.75, 0.5))),
    ]);
    let mut state = TrackState { point: PixelPoint::new(5, 6), detected: false };

    let annotated = Tracker::default().observe(&frame, &result, &mut state);

    assert_eq!(state, TrackState { point: PixelPoint::new(5, 6), detected: false });
    assert_eq!(annotated, frame.to_rgb_image());
  }

  #[test]
  fn no_face_keeps_stale_point() {
    let frame = RgbNhwcFrame::<64, 48>::default();
    let mut state = TrackState { point: PixelPoint::new(5, 6), detected: false };

    let annotated = Tracker::default().observe(&frame, &FaceDetectResult::default(), &mut state);

    assert_eq!(state, TrackState { point: PixelPoint::new(5, 6), detected: false });
    assert_eq!(annotated, frame.to_rgb_image());
  }

  #[test]
  fn unusable_keypoints_are_ignored() {
    let frame = RgbNhwcFrame::<64, 48>::default();
    let mut state = TrackState::default();
    let tracker = Tracker::default();

    tracker.observe(&frame, &FaceDetectResult::from(vec![face(&[])]), &mut state);
    assert!(!state.detected);

    tracker.observe(&frame, &FaceDetectResult::from(vec![face(&[(0.1, 0.1), (0.2, 0.2)])]), &mut state);
    assert!(!state.detected);

    tracker.observe(&frame, &FaceDetectResult::from(vec![face(&five_points((1.2, 0.5)))]), &mut state);
    assert_eq!(state, TrackState::default());
  }

  #[test]
  fn keypoint_index_is_configurable() {
    let frame = RgbNhwcFrame::<64, 48>::default();
    let result = FaceDetectResult::from(vec![face(&five_points((0.25, 0.5)))]);
    let mut state = TrackState::default();

    Tracker::new(0).observe(&frame, &result, &mut state);
    assert_eq!(state.point, normalized_to_pixel(0.3, 0.3, 64, 48).unwrap());
  }
}
