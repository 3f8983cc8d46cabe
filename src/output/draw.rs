// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/output/draw.rs - 跟踪点可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};

use crate::{output::TrackReport, track::PixelPoint};

const MARKER_CIRCLE_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const MARKER_LINE_COLOR: [u8; 3] = [255, 255, 0]; // 黄色
const MARKER_RADIUS: i32 = 3;
const MARKER_THICKNESS: u32 = 2;

/// 跟踪点标记：实心圆加贯穿整帧的十字线
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
  pub circle_color: [u8; 3],
  pub line_color: [u8; 3],
  pub radius: i32,
  pub thickness: u32,
}

impl Default for Marker {
  fn default() -> Self {
    Self {
      circle_color: MARKER_CIRCLE_COLOR,
      line_color: MARKER_LINE_COLOR,
      radius: MARKER_RADIUS,
      thickness: MARKER_THICKNESS,
    }
  }
}

impl Marker {
  /// 十字线在圆之后绘制，交点处为线的颜色
  pub fn draw(&self, image: &mut RgbImage, point: PixelPoint) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
      return;
    }
    let x = point.x.min(w - 1);
    let y = point.y.min(h - 1);

    draw_filled_circle_mut(
      image,
      (x as i32, y as i32),
      self.radius,
      Rgb(self.circle_color),
    );

    for t in 0..self.thickness {
      let row = (y + t).min(h - 1) as f32;
      let col = (x + t).min(w - 1) as f32;
      draw_line_segment_mut(
        image,
        (0.0, row),
        ((w - 1) as f32, row),
        Rgb(self.line_color),
      );
      draw_line_segment_mut(
        image,
        (col, 0.0),
        (col, (h - 1) as f32),
        Rgb(self.line_color),
      );
    }
  }
}

/// 记录跟踪结果的文本形式
pub struct Record;

impl Record {
  pub fn line(report: &TrackReport) -> String {
    format!(
      "{}, {}, {}, {}, {}",
      report.frame_index,
      report.message,
      report.state.detected as u8,
      report.state.point.x,
      report.state.point.y
    )
  }

  pub fn record(report: &TrackReport, path: &std::path::Path) -> Result<(), std::io::Error> {
    std::fs::write(path.with_extension("txt"), Self::line(report))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{protocol::CoordinateMessage, track::TrackState};

  #[test]
  fn marker_at_corner_stays_in_bounds() {
    let mut image = RgbImage::new(10, 8);
    Marker::default().draw(&mut image, PixelPoint::new(9, 7));
    assert_eq!(image.get_pixel(9, 7), &Rgb(MARKER_LINE_COLOR));
    assert_eq!(image.get_pixel(0, 7), &Rgb(MARKER_LINE_COLOR));
    assert_eq!(image.get_pixel(9, 0), &Rgb(MARKER_LINE_COLOR));
    assert_eq!(image.get_pixel(0, 0), &Rgb([0, 0, 0]));
  }

  #[test]
  fn crosshair_is_two_pixels_thick() {
    let mut image = RgbImage::new(20, 20);
    Marker::default().draw(&mut image, PixelPoint::new(5, 10));
    for x in [0, 19] {
      assert_eq!(image.get_pixel(x, 10), &Rgb(MARKER_LINE_COLOR));
      assert_eq!(image.get_pixel(x, 11), &Rgb(MARKER_LINE_COLOR));
      assert_eq!(image.get_pixel(x, 12), &Rgb([0, 0, 0]));
    }
    assert_eq!(image.get_pixel(6, 0), &Rgb(MARKER_LINE_COLOR));
    assert_eq!(image.get_pixel(7, 0), &Rgb([0, 0, 0]));
  }

  #[test]
  fn record_line_lists_message_and_state() {
    let report = TrackReport {
      frame_index: 7,
      state: TrackState {
        point: PixelPoint::new(45, 7),
        detected: true,
      },
      message: CoordinateMessage::try_from(*b"045007").unwrap(),
    };
    assert_eq!(Record::line(&report), "7, 045007, 1, 45, 7");
  }
}
