// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/task.rs - 跟踪任务
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  sync::mpsc::{self, Receiver},
  thread,
  time::{Duration, Instant},
};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::RgbNhwcFrame,
  link::Transmit,
  model::{FaceDetectResult, Model},
  output::{FrameSnapshot, Render, TrackReport},
  protocol::CoordinateEncoder,
  track::{TrackState, Tracker},
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub trait Task<I, M, L, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, link: L, output: O) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum TrackError {
  #[error("推理失败: {0}")]
  Detect(#[source] BoxError),
  #[error("发送失败: {0}")]
  Transmit(#[source] BoxError),
  #[error("渲染失败: {0}")]
  Render(#[source] BoxError),
  #[error("写入帧快照失败: {0}")]
  Snapshot(#[source] BoxError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  /// 输入结束或读取失败
  InputExhausted,
  /// 收到中断信号
  Cancelled,
  /// 达到指定帧数
  FrameLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSummary {
  pub frames: u64,
  pub detections: u64,
  pub stop: StopReason,
}

/// 安装 Ctrl-C 处理器，每个进程只能调用一次
///
/// 30 秒内主循环仍未退出时强制结束进程。
pub fn install_stop_signal() -> Result<Receiver<()>, ctrlc::Error> {
  let (tx, rx) = mpsc::channel();

  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;

  Ok(rx)
}

/// 逐帧执行 快照 → 检测 → 提取 → 编码 → 发送 → 渲染
#[derive(Default, Debug)]
pub struct TrackingTask {
  tracker: Tracker,
  encoder: CoordinateEncoder,
  frame_number: Option<usize>,
  stop: Option<Receiver<()>>,
  snapshot: Option<FrameSnapshot>,
}

impl TrackingTask {
  pub fn with_tracker(mut self, tracker: Tracker) -> Self {
    self.tracker = tracker;
    self
  }

  pub fn with_encoder(mut self, encoder: CoordinateEncoder) -> Self {
    self.encoder = encoder;
    self
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_stop_signal(mut self, stop: Receiver<()>) -> Self {
    self.stop = Some(stop);
    self
  }

  pub fn with_snapshot(mut self, snapshot: Option<FrameSnapshot>) -> Self {
    self.snapshot = snapshot;
    self
  }

  fn stop_requested(&self) -> bool {
    self.stop.as_ref().is_some_and(|rx| rx.try_recv().is_ok())
  }
}

impl<
  const W: u32,
  const H: u32,
  ME: std::error::Error + Sync + Send + 'static,
  LE: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = RgbNhwcFrame<W, H>>,
  M: Model<Input = RgbNhwcFrame<W, H>, Output = FaceDetectResult, Error = ME>,
  L: Transmit<Error = LE>,
  O: Render<RgbImage, TrackReport, Error = RE>,
> Task<I, M, L, O> for TrackingTask
{
  type Output = TaskSummary;
  type Error = TrackError;

  fn run_task(self, input: I, model: M, link: L, output: O) -> Result<TaskSummary, TrackError> {
    info!("开始跟踪任务, 关键点 #{}", self.tracker.keypoint_index());

    let mut state = TrackState::default();
    let mut frames = 0u64;
    let mut detections = 0u64;
    let mut stop = StopReason::InputExhausted;

    for frame in input {
      let now = Instant::now();

      if let Some(snapshot) = &self.snapshot {
        snapshot
          .write(&frame)
          .map_err(|e| TrackError::Snapshot(Box::new(e)))?;
      }

      let result = model
        .infer(&frame)
        .map_err(|e| TrackError::Detect(Box::new(e)))?;
      let elapsed_infer = now.elapsed();

      let annotated = self.tracker.observe(&frame, &result, &mut state);
      let message = self.encoder.encode(&state);

      link
        .transmit(&message)
        .map_err(|e| TrackError::Transmit(Box::new(e)))?;

      let report = TrackReport {
        frame_index: frames,
        state,
        message,
      };
      output
        .render_result(&annotated, &report)
        .map_err(|e| TrackError::Render(Box::new(e)))?;

      if state.detected {
        detections += 1;
      }
      state.reset_flag();
      frames += 1;

      debug!(
        "第 {} 帧: {} 张人脸, 发送 {}, 耗时 {:.2?} / {:.2?}",
        frames,
        result.len(),
        message,
        elapsed_infer,
        now.elapsed()
      );

      if self.frame_number.is_some_and(|n| frames >= n as u64) {
        info!("达到指定帧数 {}, 退出任务循环", frames);
        stop = StopReason::FrameLimit;
        break;
      }
      if self.stop_requested() {
        warn!("中断信号接收，退出任务循环");
        stop = StopReason::Cancelled;
        break;
      }
    }

    info!(
      "任务完成: 共 {} 帧, 其中 {} 帧检测到目标, 结束原因 {:?}",
      frames, detections, stop
    );

    Ok(TaskSummary {
      frames,
      detections,
      stop,
    })
  }
}
