// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/protocol.rs - 串口坐标编码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! 下位机协议
//!
//! 每帧发送恰好 6 个 ASCII 数字字节：3 位补零的 x 与 3 位补零的 y，
//! 无分隔符、无结束符、无校验。本帧没有有效检测时发送待机位置 `320240`。

use std::fmt;

use thiserror::Error;

use crate::track::{PixelPoint, TrackState};

pub const MESSAGE_LEN: usize = 6;

/// 待机位置，640×480 画面的中心
pub const IDLE_POINT: PixelPoint = PixelPoint::new(320, 240);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessageError {
  #[error("消息长度必须为 6, 实际为 {0}")]
  Length(usize),
  #[error("消息包含非数字字节: {0:?}")]
  NonDigit(Vec<u8>),
}

/// 一条 6 字节的坐标消息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoordinateMessage([u8; MESSAGE_LEN]);

impl CoordinateMessage {
  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  pub fn as_str(&self) -> &str {
    // 构造时保证全部为 ASCII 数字
    std::str::from_utf8(&self.0).unwrap_or_default()
  }

  /// 还原为下位机看到的像素坐标
  pub fn parse(&self) -> PixelPoint {
    let number = |digits: &[u8]| {
      digits
        .iter()
        .fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0'))
    };
    PixelPoint::new(number(&self.0[..3]), number(&self.0[3..]))
  }
}

impl TryFrom<[u8; MESSAGE_LEN]> for CoordinateMessage {
  type Error = MessageError;

  fn try_from(bytes: [u8; MESSAGE_LEN]) -> Result<Self, Self::Error> {
    if !bytes.iter().all(u8::is_ascii_digit) {
      return Err(MessageError::NonDigit(bytes.to_vec()));
    }
    Ok(Self(bytes))
  }
}

impl TryFrom<&[u8]> for CoordinateMessage {
  type Error = MessageError;

  fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
    let bytes: [u8; MESSAGE_LEN] = bytes
      .try_into()
      .map_err(|_| MessageError::Length(bytes.len()))?;
    Self::try_from(bytes)
  }
}

impl fmt::Display for CoordinateMessage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 坐标编码器
#[derive(Debug, Clone, Copy)]
pub struct CoordinateEncoder {
  idle: CoordinateMessage,
}

impl Default for CoordinateEncoder {
  fn default() -> Self {
    Self {
      idle: CoordinateMessage(*b"320240"),
    }
  }
}

impl CoordinateEncoder {
  /// 使用自定义待机位置，位置必须能编码为 6 位
  pub fn with_idle(idle: PixelPoint) -> Result<Self, MessageError> {
    let idle = Self::format(idle)?;
    Ok(Self { idle })
  }

  pub fn idle(&self) -> CoordinateMessage {
    self.idle
  }

  fn format(point: PixelPoint) -> Result<CoordinateMessage, MessageError> {
    let text = format!("{:03}{:03}", point.x, point.y);
    CoordinateMessage::try_from(text.as_bytes())
  }

  /// 本帧未检测到或坐标超出三位数时返回待机位置
  pub fn encode(&self, state: &TrackState) -> CoordinateMessage {
    if !state.detected {
      return self.idle;
    }
    Self::format(state.point).unwrap_or(self.idle)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn detected(x: u32, y: u32) -> TrackState {
    TrackState {
      point: PixelPoint::new(x, y),
      detected: true,
    }
  }

  #[test]
  fn encodes_zero_padded_pairs() {
    let encoder = CoordinateEncoder::default();
    assert_eq!(encoder.encode(&detected(0, 0)).as_str(), "000000");
    assert_eq!(encoder.encode(&detected(45, 7)).as_str(), "045007");
    assert_eq!(encoder.encode(&detected(639, 479)).as_str(), "639479");
    assert_eq!(encoder.encode(&detected(5, 123)).as_bytes(), b"005123");
  }

  #[test]
  fn falls_back_when_not_detected() {
    let encoder = CoordinateEncoder::default();
    let state = TrackState {
      point: PixelPoint::new(100, 200),
      detected: false,
    };
    assert_eq!(encoder.encode(&state).as_str(), "320240");
  }

  #[test]
  fn falls_back_on_four_digit_coordinates() {
    let encoder = CoordinateEncoder::default();
    assert_eq!(encoder.encode(&detected(1000, 5)).as_str(), "320240");
    assert_eq!(encoder.encode(&detected(5, 1280)).as_str(), "320240");
  }

  #[test]
  fn parse_reads_back_receiver_view() {
    let message = CoordinateEncoder::default().encode(&detected(45, 7));
    assert_eq!(message.parse(), PixelPoint::new(45, 7));
    assert_eq!(IDLE_POINT, CoordinateEncoder::default().idle().parse());
  }

  #[test]
  fn rejects_malformed_messages() {
    assert_eq!(
      CoordinateMessage::try_from(&b"12345"[..]),
      Err(MessageError::Length(5))
    );
    assert!(matches!(
      CoordinateMessage::try_from(*b"12a456"),
      Err(MessageError::NonDigit(_))
    ));
    assert!(CoordinateEncoder::with_idle(PixelPoint::new(1000, 0)).is_err());
    assert_eq!(
      CoordinateEncoder::with_idle(PixelPoint::new(160, 120))
        .unwrap()
        .idle()
        .as_str(),
      "160120"
    );
  }
}
