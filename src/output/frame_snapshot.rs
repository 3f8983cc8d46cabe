// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/output/frame_snapshot.rs - 当前帧快照
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::frame::RgbNhwcFrame;

/// 每帧覆盖写入的原始帧文件，drop 时删除
#[derive(Debug)]
pub struct FrameSnapshot {
  path: PathBuf,
}

impl FrameSnapshot {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    info!("帧快照文件: {}", path.display());
    Self { path }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn write<const W: u32, const H: u32>(
    &self,
    frame: &RgbNhwcFrame<W, H>,
  ) -> Result<(), image::ImageError> {
    frame.to_rgb_image().save(&self.path)?;
    debug!("帧快照已写入: {}", self.path.display());
    Ok(())
  }
}

impl Drop for FrameSnapshot {
  fn drop(&mut self) {
    match std::fs::remove_file(&self.path) {
      Ok(()) => info!("帧快照已删除: {}", self.path.display()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => warn!("无法删除帧快照 {}: {}", self.path.display(), e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snapshot_is_removed_on_drop() {
    let path = std::env::temp_dir().join(format!("zhuiguang-snapshot-{}.png", std::process::id()));
    {
      let snapshot = FrameSnapshot::new(&path);
      snapshot.write(&RgbNhwcFrame::<8, 4>::default()).unwrap();
      assert!(path.exists());
      snapshot.write(&RgbNhwcFrame::<8, 4>::default()).unwrap();
    }
    assert!(!path.exists());
  }

  #[test]
  fn unused_snapshot_drops_quietly() {
    let path = std::env::temp_dir().join(format!("zhuiguang-unused-{}.png", std::process::id()));
    drop(FrameSnapshot::new(&path));
    assert!(!path.exists());
  }
}
