// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh
// -----
// Created Date: 2023/10/13 09:12:37

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::{
    pool::DEFAULT_POOL_CLASSES,
    prot::MAX_FRAME_LENGTH,
    ProxyError, ProxyResult,
};

use super::{ConfigDuration, ConfigSize, DisplayFromStrOrNumber};

fn default_pool_classes() -> Vec<usize> {
    DEFAULT_POOL_CLASSES.to_vec()
}

/// 多路复用会话的参数, 通信双方需保持一致
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// 协议版本号
    pub version: u8,
    /// 关闭心跳
    pub keep_alive_disabled: bool,
    /// 空闲时发送心跳的间隔
    #[serde_as(as = "DisplayFromStr")]
    pub keep_alive_interval: ConfigDuration,
    /// 超过该时长未收到任何数据则认为连接已断
    #[serde_as(as = "DisplayFromStr")]
    pub keep_alive_timeout: ConfigDuration,
    /// 单帧最大负载
    #[serde_as(as = "DisplayFromStrOrNumber")]
    pub max_frame_size: ConfigSize,
    /// 每个流的接收窗口, 同时也是对端的初始发送窗口
    #[serde_as(as = "DisplayFromStrOrNumber")]
    pub max_stream_buffer: ConfigSize,
    /// 等待accept的流的最大数量, 超出则直接拒绝
    pub accept_backlog: usize,
    /// 缓冲池的分级
    #[serde(default = "default_pool_classes")]
    pub pool_classes: Vec<usize>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            version: 1,
            keep_alive_disabled: false,
            keep_alive_interval: ConfigDuration::from_secs(10),
            keep_alive_timeout: ConfigDuration::from_secs(30),
            max_frame_size: ConfigSize(32 * 1024),
            max_stream_buffer: ConfigSize(256 * 1024),
            accept_backlog: 1024,
            pool_classes: default_pool_classes(),
        }
    }
}

impl MuxConfig {
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size.as_usize()
    }

    pub fn max_stream_buffer(&self) -> usize {
        self.max_stream_buffer.as_usize()
    }

    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval.0
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        self.keep_alive_timeout.0
    }

    /// 检查参数是否合法
    pub fn verify(&self) -> ProxyResult<()> {
        if !self.keep_alive_disabled {
            if self.keep_alive_interval.is_zero() {
                return Err(ProxyError::Extension("keep_alive_interval必须大于0"));
            }
            // 对端最长可能间隔两个周期才发出心跳
            if self.keep_alive_timeout.0 < self.keep_alive_interval.0 * 2 {
                return Err(ProxyError::Extension(
                    "keep_alive_timeout必须不小于两倍的keep_alive_interval",
                ));
            }
        }
        if self.max_frame_size() == 0 || self.max_frame_size() > MAX_FRAME_LENGTH {
            return Err(ProxyError::Extension("max_frame_size必须在1到65535之间"));
        }
        if self.max_stream_buffer() < self.max_frame_size() {
            return Err(ProxyError::Extension("max_stream_buffer必须不小于max_frame_size"));
        }
        if self.max_stream_buffer() > u32::MAX as usize {
            return Err(ProxyError::Extension("max_stream_buffer过大"));
        }
        if self.accept_backlog == 0 {
            return Err(ProxyError::Extension("accept_backlog必须大于0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_verify() {
        assert!(MuxConfig::default().verify().is_ok());
    }

    #[test]
    fn test_invalid() {
        let mut config = MuxConfig::default();
        config.max_frame_size = ConfigSize(70000);
        assert!(config.verify().is_err());

        let mut config = MuxConfig::default();
        config.keep_alive_timeout = ConfigDuration::from_secs(1);
        assert!(config.verify().is_err());
        config.keep_alive_disabled = true;
        assert!(config.verify().is_ok());

        let mut config = MuxConfig::default();
        config.max_stream_buffer = ConfigSize(1024);
        assert!(config.verify().is_err());
    }

    #[test]
    fn test_toml() {
        let config: MuxConfig = toml::from_str(
            r#"
            keep_alive_interval = "500ms"
            keep_alive_timeout = "2s"
            max_frame_size = "16k"
            max_stream_buffer = 131072
            "#,
        )
        .unwrap();
        assert_eq!(config.keep_alive_interval(), Duration::from_millis(500));
        assert_eq!(config.max_frame_size(), 16384);
        assert_eq!(config.max_stream_buffer(), 131072);
        assert_eq!(config.version, 1);
        assert_eq!(config.pool_classes.len(), 17);
    }
}
