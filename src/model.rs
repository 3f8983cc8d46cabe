// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/model.rs - 模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 归一化的关键点坐标，正常情况下位于 [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
  pub x: f32,
  pub y: f32,
}

impl Keypoint {
  pub fn new(x: f32, y: f32) -> Self {
    Self { x, y }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceDetection {
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
  pub keypoints: Box<[Keypoint]>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceDetectResult {
  pub items: Box<[FaceDetection]>,
}

impl FaceDetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

impl From<Vec<FaceDetection>> for FaceDetectResult {
  fn from(items: Vec<FaceDetection>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

mod scrfd;
pub use self::scrfd::{Scrfd, ScrfdBuilder, ScrfdError, ScrfdThreshold};
