// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/bin/face_track.rs - 摄像头人脸跟踪
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use url::Url;

use zhuiguang::{
  FromUrl,
  input::InputWrapper,
  link::LinkWrapper,
  model::ScrfdBuilder,
  output::{FrameSnapshot, OutputWrapper},
  protocol::CoordinateEncoder,
  task::{Task, TrackingTask, install_stop_signal},
  track::{DEFAULT_KEYPOINT_INDEX, PixelPoint, Tracker},
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

/// Zhuiguang 人脸跟踪参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// RKNN 模型文件路径
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE", default_value = "gst://camera/dev/video2")]
  pub input: Url,
  /// 下位机链路
  #[arg(
    long,
    value_name = "LINK",
    default_value = "serial:///dev/ttyACM0?baud=115200&timeout=10"
  )]
  pub link: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT", default_value = "gstvideo:output.avi?fps=10")]
  pub output: Url,
  /// 处理的最大帧数，不指定时一直运行
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
  /// 每帧覆盖写入原始帧的文件，退出时删除
  #[arg(long, value_name = "PATH")]
  pub snapshot: Option<PathBuf>,
  /// 跟踪的关键点序号
  #[arg(long, value_name = "INDEX", default_value_t = DEFAULT_KEYPOINT_INDEX)]
  pub keypoint: usize,
  /// 未检测到人脸时发送的待机位置
  #[arg(long, value_name = "X,Y", default_value = "320,240")]
  pub idle: PixelPoint,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("下位机链路: {}", args.link);
  info!("输出路径: {}", args.output);

  let input = InputWrapper::<WIDTH, HEIGHT>::from_url(&args.input)?;
  let model = ScrfdBuilder::from_url(&args.model)?.build::<WIDTH, HEIGHT>()?;
  let link = LinkWrapper::from_url(&args.link)?;
  let output = OutputWrapper::<WIDTH, HEIGHT>::from_url(&args.output)?;
  let stop = install_stop_signal()?;

  let task = TrackingTask::default()
    .with_tracker(Tracker::new(args.keypoint))
    .with_encoder(CoordinateEncoder::with_idle(args.idle)?)
    .with_frame_number(args.frame_number)
    .with_stop_signal(stop)
    .with_snapshot(args.snapshot.map(FrameSnapshot::new));

  match task.run_task(input.into_nhwc(), model, link, output) {
    Ok(summary) => {
      info!(
        "处理 {} 帧, {} 帧检测到人脸, 结束原因 {:?}",
        summary.frames, summary.detections, summary.stop
      );
      Ok(())
    }
    Err(e) => {
      error!("跟踪任务失败: {}", e);
      Err(e.into())
    }
  }
}
