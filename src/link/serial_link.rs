// 该文件是 Zhuiguang （追光） 项目的一部分。
// src/link/serial_link.rs - 串口链路
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! 串口输出
//!
//! URL 格式：`serial:///dev/ttyACM0?baud=115200&timeout=10`
//!
//! - `baud`: 波特率，默认 115200
//! - `timeout`: 读超时（毫秒），默认 10
//! - `write_timeout`: 写超时（毫秒），默认一天，下位机暂停读取时发送阻塞等待

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use serialport::SerialPort;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, link::Transmit, protocol::CoordinateMessage};

const DEFAULT_BAUD_RATE: u32 = 115_200;
const DEFAULT_TIMEOUT_MS: u64 = 10;
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
pub enum SerialLinkError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("参数错误: {0}={1}")]
  InvalidParameter(String, String),
  #[error("串口错误: {0}")]
  SerialPortError(#[from] serialport::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("串口锁已损坏")]
  Poisoned,
}

/// 串口参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialLinkConfig {
  pub path: String,
  pub baud_rate: u32,
  pub timeout: Duration,
  pub write_timeout: Duration,
}

impl SerialLinkConfig {
  pub fn from_url(url: &Url) -> Result<Self, SerialLinkError> {
    if url.scheme() != SerialLink::SCHEME {
      return Err(SerialLinkError::SchemeMismatch);
    }

    let mut config = SerialLinkConfig {
      path: url.path().to_string(),
      baud_rate: DEFAULT_BAUD_RATE,
      timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
      write_timeout: DEFAULT_WRITE_TIMEOUT,
    };

    for (k, v) in url.query_pairs() {
      let invalid = || SerialLinkError::InvalidParameter(k.to_string(), v.to_string());
      match &*k {
        "baud" => config.baud_rate = v.parse().map_err(|_| invalid())?,
        "timeout" => config.timeout = Duration::from_millis(v.parse().map_err(|_| invalid())?),
        "write_timeout" => {
          config.write_timeout = Duration::from_millis(v.parse().map_err(|_| invalid())?)
        }
        _ => {}
      }
    }

    Ok(config)
  }
}

/// 串口链路，每次发送写入 6 个字节，不等待应答、不重试
///
/// 端口平时使用读超时；发送期间临时切换为写超时。
pub struct SerialLink {
  port: Mutex<Box<dyn SerialPort>>,
  config: SerialLinkConfig,
}

impl FromUrlWithScheme for SerialLink {
  const SCHEME: &'static str = "serial";
}

impl FromUrl for SerialLink {
  type Error = SerialLinkError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let config = SerialLinkConfig::from_url(url)?;
    Self::open(config)
  }
}

impl SerialLink {
  pub fn open(config: SerialLinkConfig) -> Result<Self, SerialLinkError> {
    let port = serialport::new(&config.path, config.baud_rate)
      .timeout(config.timeout)
      .open()?;

    info!(
      "串口已打开: {} @ {} baud, 读超时 {:?}, 写超时 {:?}",
      config.path, config.baud_rate, config.timeout, config.write_timeout
    );

    Self::with_port(port, config)
  }

  /// 使用已打开的端口，端口超时重置为读超时
  pub fn with_port(
    mut port: Box<dyn SerialPort>,
    config: SerialLinkConfig,
  ) -> Result<Self, SerialLinkError> {
    port.set_timeout(config.timeout)?;
    Ok(SerialLink {
      port: Mutex::new(port),
      config,
    })
  }
}

impl Transmit for SerialLink {
  type Error = SerialLinkError;

  fn transmit(&self, message: &CoordinateMessage) -> Result<(), Self::Error> {
    let mut port = self.port.lock().map_err(|_| SerialLinkError::Poisoned)?;
    port.set_timeout(self.config.write_timeout)?;
    let written = port
      .write_all(message.as_bytes())
      .and_then(|()| port.flush());
    port.set_timeout(self.config.timeout)?;
    written?;
    debug!("串口发送: {}", message);
    Ok(())
  }
}

impl Drop for SerialLink {
  fn drop(&mut self) {
    info!("串口已关闭: {}", self.config.path);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn config_defaults() {
    let url = Url::parse("serial:///dev/ttyACM0").unwrap();
    assert_eq!(
      SerialLinkConfig::from_url(&url).unwrap(),
      SerialLinkConfig {
        path: "/dev/ttyACM0".to_string(),
        baud_rate: 115_200,
        timeout: Duration::from_millis(10),
        write_timeout: DEFAULT_WRITE_TIMEOUT,
      }
    );
  }

  #[test]
  fn config_reads_query() {
    let url =
      Url::parse("serial:///dev/ttyUSB1?baud=9600&timeout=50&write_timeout=2000").unwrap();
    let config = SerialLinkConfig::from_url(&url).unwrap();
    assert_eq!(config.baud_rate, 9600);
    assert_eq!(config.timeout, Duration::from_millis(50));
    assert_eq!(config.write_timeout, Duration::from_secs(2));
  }

  #[test]
  fn config_rejects_bad_values() {
    let url = Url::parse("serial:///dev/ttyACM0?baud=fast").unwrap();
    assert!(matches!(
      SerialLinkConfig::from_url(&url),
      Err(SerialLinkError::InvalidParameter(k, v)) if k == "baud" && v == "fast"
    ));

    let url = Url::parse("log://").unwrap();
    assert!(matches!(
      SerialLinkConfig::from_url(&url),
      Err(SerialLinkError::SchemeMismatch)
    ));
  }

  #[cfg(unix)]
  #[test]
  fn transmit_waits_for_slow_receiver() {
    use std::io::Read;

    use serialport::TTYPort;

    const MESSAGES: usize = 5000;

    let (master, mut slave) = TTYPort::pair().unwrap();
    slave.set_timeout(Duration::from_secs(5)).unwrap();

    let config = SerialLinkConfig {
      path: "pty".to_string(),
      baud_rate: DEFAULT_BAUD_RATE,
      timeout: Duration::from_millis(10),
      write_timeout: Duration::from_secs(5),
    };
    let link = SerialLink::with_port(Box::new(master), config).unwrap();

    // 接收端停顿远超读超时后才开始读取
    let reader = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(200));
      let mut received = vec![0u8; MESSAGES * 6];
      slave.read_exact(&mut received).map(|()| received)
    });

    let message = CoordinateMessage::try_from(*b"160360").unwrap();
    for i in 0..MESSAGES {
      if let Err(e) = link.transmit(&message) {
        panic!("message #{} failed: {}", i, e);
      }
    }

    let received = reader.join().unwrap().unwrap();
    assert!(received.chunks_exact(6).all(|chunk| chunk == b"160360"));
    assert_eq!(
      link.port.lock().unwrap().timeout(),
      Duration::from_millis(10)
    );
  }
}
