// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/link.rs - 下位机链路
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Mutex;

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, protocol::CoordinateMessage};

/// 坐标发送端，发送后不等待应答
pub trait Transmit {
  type Error;
  fn transmit(&self, message: &CoordinateMessage) -> Result<(), Self::Error>;
}

#[cfg(feature = "serial_link")]
mod serial_link;
#[cfg(feature = "serial_link")]
pub use self::serial_link::{SerialLink, SerialLinkError};

#[derive(Error, Debug)]
pub enum LinkError {
  #[cfg(feature = "serial_link")]
  #[error("串口链路错误: {0}")]
  SerialLinkError(#[from] SerialLinkError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 仅记录日志的链路，用于没有下位机时调试
#[derive(Debug, Default)]
pub struct LogLink;

impl FromUrlWithScheme for LogLink {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogLink {
  type Error = LinkError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(LinkError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(LogLink)
  }
}

impl Transmit for LogLink {
  type Error = LinkError;

  fn transmit(&self, message: &CoordinateMessage) -> Result<(), Self::Error> {
    let point = message.parse();
    info!("发送 {} -> ({}, {})", message, point.x, point.y);
    Ok(())
  }
}

/// 在内存中保存所有发送过的消息
#[derive(Debug, Default)]
pub struct MemoryLink {
  sent: Mutex<Vec<CoordinateMessage>>,
}

impl MemoryLink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn sent(&self) -> Vec<CoordinateMessage> {
    self
      .sent
      .lock()
      .map(|sent| sent.clone())
      .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
  }

  /// 线路上实际出现的字节流
  pub fn wire_bytes(&self) -> Vec<u8> {
    self
      .sent()
      .iter()
      .flat_map(|m| m.as_bytes().iter().copied())
      .collect()
  }
}

impl Transmit for MemoryLink {
  type Error = std::convert::Infallible;

  fn transmit(&self, message: &CoordinateMessage) -> Result<(), Self::Error> {
    self
      .sent
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .push(*message);
    Ok(())
  }
}

impl<T: Transmit> Transmit for &T {
  type Error = T::Error;

  fn transmit(&self, message: &CoordinateMessage) -> Result<(), Self::Error> {
    (**self).transmit(message)
  }
}

pub enum LinkWrapper {
  #[cfg(feature = "serial_link")]
  Serial(SerialLink),
  Log(LogLink),
}

impl FromUrl for LinkWrapper {
  type Error = LinkError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "serial_link")]
      SerialLink::SCHEME => Ok(LinkWrapper::Serial(SerialLink::from_url(url)?)),
      LogLink::SCHEME => Ok(LinkWrapper::Log(LogLink::from_url(url)?)),
      other => Err(LinkError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Transmit for LinkWrapper {
  type Error = LinkError;

  fn transmit(&self, message: &CoordinateMessage) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "serial_link")]
      LinkWrapper::Serial(link) => link.transmit(message).map_err(LinkError::from),
      LinkWrapper::Log(link) => link.transmit(message),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn memory_link_concatenates_without_framing() {
    let link = MemoryLink::new();
    for text in [b"320240", b"045007"] {
      link
        .transmit(&CoordinateMessage::try_from(*text).unwrap())
        .unwrap();
    }
    assert_eq!(link.wire_bytes(), b"320240045007".to_vec());
    assert_eq!(link.sent().len(), 2);
  }

  #[test]
  fn wrapper_dispatches_on_scheme() {
    let url = Url::parse("log://").unwrap();
    let link = LinkWrapper::from_url(&url).unwrap();
    assert!(matches!(link, LinkWrapper::Log(_)));
    assert!(
      link
        .transmit(&CoordinateMessage::try_from(*b"000000").unwrap())
        .is_ok()
    );

    let url = Url::parse("tcp://127.0.0.1:9000").unwrap();
    assert!(matches!(
      LinkWrapper::from_url(&url),
      Err(LinkError::SchemeMismatch(s)) if s == "tcp"
    ));
  }
}
