// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/model/scrfd.rs - SCRFD 人脸检测模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use rknpu::{Context, InitFlags, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::RgbNhwcFrame,
  input::AsNhwcFrame,
  model::{FaceDetectResult, FaceDetection, Keypoint, Model},
};

const SCRFD_NUM_INPUTS: u32 = 1;
const SCRFD_NUM_OUTPUTS: u32 = 9;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_NUM_ANCHORS: usize = 2;
const SCRFD_NUM_KEYPOINTS: usize = 5;

/// 检测阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrfdThreshold {
  /// 最低置信度
  pub score: f32,
  /// NMS IOU 阈值
  pub iou: f32,
}

impl Default for ScrfdThreshold {
  fn default() -> Self {
    Self {
      score: 0.7,
      iou: 0.4,
    }
  }
}

pub struct Scrfd<const W: u32, const H: u32> {
  context: Context,
  num_outputs: u32,
  threshold: ScrfdThreshold,
}

#[derive(Error, Debug)]
pub enum ScrfdError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(#[from] rknpu::Error),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("参数错误: {0}={1}")]
  InvalidParameter(String, String),
  #[error("无法读取第 {0} 个输出")]
  MissingOutput(usize),
}

impl ScrfdError {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    ScrfdError::ModelInvalid(msg.to_string(), e)
  }
}

pub struct ScrfdBuilder {
  model_path: String,
  flags: InitFlags,
  threshold: ScrfdThreshold,
}

impl FromUrlWithScheme for ScrfdBuilder {
  const SCHEME: &'static str = "scrfd";
}

impl FromUrl for ScrfdBuilder {
  type Error = ScrfdError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ScrfdError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut threshold = ScrfdThreshold::default();
    for (k, v) in url.query_pairs() {
      let slot = match &*k {
        "confidence" => &mut threshold.score,
        "iou" => &mut threshold.iou,
        _ => continue,
      };
      *slot = v
        .parse::<f32>()
        .ok()
        .filter(|t| (0.0..=1.0).contains(t))
        .ok_or_else(|| ScrfdError::InvalidParameter(k.to_string(), v.to_string()))?;
    }

    Ok(ScrfdBuilder {
      model_path: url.path().to_string(),
      flags: InitFlags::default(),
      threshold,
    })
  }
}

impl ScrfdBuilder {
  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn threshold(&self) -> ScrfdThreshold {
    self.threshold
  }

  pub fn build<const W: u32, const H: u32>(self) -> Result<Scrfd<W, H>, ScrfdError> {
    info!("加载模型文件: {}", self.model_path);
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, self.flags)?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(ScrfdError::invalid("无法查询 SDK 版本", e));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| ScrfdError::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| ScrfdError::invalid("无法获取输出数量", e))?;

    for (what, expected, actual) in [
      ("输入", SCRFD_NUM_INPUTS, num_inputs),
      ("输出", SCRFD_NUM_OUTPUTS, num_outputs),
    ] {
      if expected != actual {
        let msg = format!("预期模型{}数量为 {}, 实际为 {}", what, expected, actual);
        error!("{}", msg);
        return Err(ScrfdError::invalid(&msg, rknpu::Error::InvalidModel));
      }
    }

    info!(
      "模型加载完成, 输入尺寸 {}x{}, 置信度阈值 {}, NMS 阈值 {}",
      W, H, self.threshold.score, self.threshold.iou
    );

    Ok(Scrfd {
      context,
      num_outputs,
      threshold: self.threshold,
    })
  }
}

impl<const W: u32, const H: u32> Model for Scrfd<W, H> {
  type Input = RgbNhwcFrame<W, H>;
  type Output = FaceDetectResult;
  type Error = ScrfdError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    debug!("设置模型输入");
    self.context.set_input(
      0,
      input.as_nhwc(),
      rknpu::TensorFormat::NHWC,
      TensorType::UInt8,
    )?;

    debug!("执行模型推理");
    self.context.run()?;

    let output = self.context.get_outputs()?;
    let mut tensors = Vec::with_capacity(self.num_outputs as usize);
    for idx in 0..self.num_outputs as usize {
      match output.get_f32(idx) {
        Ok(data) => tensors.push(data.to_vec()),
        Err(e) => {
          error!("获取第 {} 个输出失败: {}", idx, e);
          return Err(ScrfdError::MissingOutput(idx));
        }
      }
    }

    Ok(decode_outputs(&tensors, W, H, self.threshold))
  }
}

/// 单个步长对应的三个输出张量
struct StrideHead<'a> {
  scores: &'a [f32],
  bboxes: &'a [f32],
  keypoints: &'a [f32],
}

/// 按张量大小定位某一步长的输出
///
/// RKNN 导出的输出顺序有两种：按类型分组 (score×3, bbox×3, kps×3)
/// 或按步长交错 (score, bbox, kps)×3。
fn locate_head<'a>(tensors: &'a [Vec<f32>], head_idx: usize, anchors: usize) -> Option<StrideHead<'a>> {
  let expected = [anchors, anchors * 4, anchors * SCRFD_NUM_KEYPOINTS * 2];
  let heads = SCRFD_STRIDES.len();
  let layouts = [
    [head_idx, heads + head_idx, 2 * heads + head_idx],
    [3 * head_idx, 3 * head_idx + 1, 3 * head_idx + 2],
  ];

  for (layout_idx, layout) in layouts.iter().enumerate() {
    let matched = layout
      .iter()
      .zip(expected)
      .all(|(&i, len)| tensors.get(i).is_some_and(|t| t.len() == len));
    if matched {
      debug!("步长 {}: 使用输出布局 {} {:?}", SCRFD_STRIDES[head_idx], layout_idx, layout);
      return Some(StrideHead {
        scores: &tensors[layout[0]],
        bboxes: &tensors[layout[1]],
        keypoints: &tensors[layout[2]],
      });
    }
  }

  error!(
    "步长 {}: 找不到大小匹配的输出, 期望 {:?}, 实际 {:?}",
    SCRFD_STRIDES[head_idx],
    expected,
    tensors.iter().map(Vec::len).collect::<Vec<_>>()
  );
  None
}

/// 将 SCRFD 的原始输出解码为归一化的人脸检测结果
pub fn decode_outputs(
  tensors: &[Vec<f32>],
  width: u32,
  height: u32,
  threshold: ScrfdThreshold,
) -> FaceDetectResult {
  let (w, h) = (width as f32, height as f32);
  let mut items = Vec::new();

  for (head_idx, stride) in SCRFD_STRIDES.into_iter().enumerate() {
    let map_w = (width as usize).div_ceil(stride);
    let map_h = (height as usize).div_ceil(stride);
    let anchors = map_w * map_h * SCRFD_NUM_ANCHORS;

    let Some(head) = locate_head(tensors, head_idx, anchors) else {
      continue;
    };

    for idx in 0..anchors {
      let score = head.scores[idx];
      if score < threshold.score {
        continue;
      }

      let cell = idx / SCRFD_NUM_ANCHORS;
      let cx = ((cell % map_w) * stride) as f32;
      let cy = ((cell / map_w) * stride) as f32;
      let s = stride as f32;

      let d = &head.bboxes[idx * 4..idx * 4 + 4];
      let bbox = [
        ((cx - d[0] * s) / w).clamp(0.0, 1.0),
        ((cy - d[1] * s) / h).clamp(0.0, 1.0),
        ((cx + d[2] * s) / w).clamp(0.0, 1.0),
        ((cy + d[3] * s) / h).clamp(0.0, 1.0),
      ];

      let k = &head.keypoints[idx * SCRFD_NUM_KEYPOINTS * 2..(idx + 1) * SCRFD_NUM_KEYPOINTS * 2];
      let keypoints = k
        .chunks_exact(2)
        .map(|p| Keypoint::new((cx + p[0] * s) / w, (cy + p[1] * s) / h))
        .collect();

      items.push(FaceDetection {
        score,
        bbox,
        keypoints,
      });
    }
  }

  let items = non_max_suppression(items, threshold.iou);
  debug!("检测到 {} 张人脸", items.len());
  FaceDetectResult::from(items)
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
  let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
  let inter = ix * iy;
  let area = |r: &[f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
  let union = area(a) + area(b) - inter;
  if union <= 0.0 { 0.0 } else { inter / union }
}

fn non_max_suppression(mut items: Vec<FaceDetection>, iou_threshold: f32) -> Vec<FaceDetection> {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept: Vec<FaceDetection> = Vec::with_capacity(items.len());
  for item in items {
    if kept.iter().all(|k| iou(&k.bbox, &item.bbox) <= iou_threshold) {
      kept.push(item);
    }
  }
  kept
}

#[cfg(test)]
mod tests {
  use super::*;

  const W: u32 = 64;
  const H: u32 = 32;

  /// 构造分组布局的空输出
  fn empty_outputs() -> Vec<Vec<f32>> {
    let anchors: Vec<usize> = SCRFD_STRIDES
      .iter()
      .map(|s| (W as usize).div_ceil(*s) * (H as usize).div_ceil(*s) * SCRFD_NUM_ANCHORS)
      .collect();
    let mut tensors = Vec::new();
    for n in &anchors {
      tensors.push(vec![0.0; *n]);
    }
    for n in &anchors {
      tensors.push(vec![0.0; n * 4]);
    }
    for n in &anchors {
      tensors.push(vec![0.0; n * 10]);
    }
    tensors
  }

  fn set_anchor(tensors: &mut [Vec<f32>], head: usize, idx: usize, score: f32, bbox: [f32; 4], kps: [f32; 10]) {
    tensors[head][idx] = score;
    tensors[3 + head][idx * 4..idx * 4 + 4].copy_from_slice(&bbox);
    tensors[6 + head][idx * 10..idx * 10 + 10].copy_from_slice(&kps);
  }

  #[test]
  fn decodes_single_anchor() {
    let mut tensors = empty_outputs();
    // 步长 8, 网格 8x4, 单元 (x=2, y=1) => 中心 (16, 8), 第二个锚点
    let idx = (8 + 2) * 2 + 1;
    let kps = [0.0, 0.0, 1.0, 0.0, 0.5, 0.5, 0.0, 1.0, 1.0, 1.0];
    set_anchor(&mut tensors, 0, idx, 0.9, [1.0, 1.0, 1.0, 1.0], kps);

    let result = decode_outputs(&tensors, W, H, ScrfdThreshold::default());
    assert_eq!(result.len(), 1);

    let face = &result.items[0];
    assert_eq!(face.score, 0.9);
    assert_eq!(face.bbox, [8.0 / 64.0, 0.0, 24.0 / 64.0, 16.0 / 32.0]);
    assert_eq!(face.keypoints.len(), 5);
    assert_eq!(face.keypoints[2], Keypoint::new(20.0 / 64.0, 12.0 / 32.0));
  }

  #[test]
  fn drops_low_scores() {
    let mut tensors = empty_outputs();
    set_anchor(&mut tensors, 1, 3, 0.69, [1.0; 4], [0.0; 10]);
    let result = decode_outputs(&tensors, W, H, ScrfdThreshold::default());
    assert!(result.is_empty());
  }

  #[test]
  fn suppresses_overlapping_faces() {
    let mut tensors = empty_outputs();
    // 同一单元的两个锚点产生相同的框
    set_anchor(&mut tensors, 0, 20, 0.8, [1.0; 4], [0.0; 10]);
    set_anchor(&mut tensors, 0, 21, 0.95, [1.0; 4], [0.0; 10]);
    // 远处的另一张人脸
    set_anchor(&mut tensors, 2, 2, 0.75, [0.5; 4], [0.0; 10]);

    let result = decode_outputs(&tensors, W, H, ScrfdThreshold::default());
    let scores: Vec<f32> = result.items.iter().map(|f| f.score).collect();
    assert_eq!(scores, vec![0.95, 0.75]);
  }

  #[test]
  fn accepts_interleaved_layout() {
    let grouped = empty_outputs();
    let mut interleaved = Vec::new();
    for head in 0..3 {
      interleaved.push(grouped[head].clone());
      interleaved.push(grouped[3 + head].clone());
      interleaved.push(grouped[6 + head].clone());
    }
    // 步长 32, 网格 2x1, 第一个锚点 => 中心 (0, 0)
    interleaved[6][0] = 0.99;
    interleaved[7][0..4].copy_from_slice(&[0.0, 0.0, 0.5, 0.5]);

    let result = decode_outputs(&interleaved, W, H, ScrfdThreshold::default());
    assert_eq!(result.len(), 1);
    assert_eq!(result.items[0].bbox, [0.0, 0.0, 16.0 / 64.0, 16.0 / 32.0]);
  }

  #[test]
  fn builder_reads_thresholds() {
    let url = Url::parse("scrfd:///opt/models/scrfd.rknn?confidence=0.5&iou=0.3").unwrap();
    let builder = ScrfdBuilder::from_url(&url).unwrap();
    assert_eq!(
      builder.threshold(),
      ScrfdThreshold {
        score: 0.5,
        iou: 0.3
      }
    );

    let url = Url::parse("scrfd:///opt/models/scrfd.rknn?confidence=high").unwrap();
    assert!(matches!(
      ScrfdBuilder::from_url(&url),
      Err(ScrfdError::InvalidParameter(k, _)) if k == "confidence"
    ));
  }
}
