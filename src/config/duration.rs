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
// Created Date: 2023/11/10 02:21:22

use std::{fmt::Display, io, str::FromStr, time::Duration};

/// 配置时长, 支持"500ms", "10s", "2min", "1h"及纯数字(秒)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub fn new(dur: Duration) -> Self {
        Self(dur)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for ConfigDuration {
    fn from(value: Duration) -> Self {
        ConfigDuration(value)
    }
}

impl From<ConfigDuration> for Duration {
    fn from(value: ConfigDuration) -> Duration {
        value.0
    }
}

fn parse_num(s: &str) -> io::Result<u64> {
    s.trim()
        .parse::<u64>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid duration"))
}

impl FromStr for ConfigDuration {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty duration"));
        }

        // "ms"与"min"需先于"s"判断
        let d = if let Some(v) = s.strip_suffix("ms") {
            Duration::from_millis(parse_num(v)?)
        } else if let Some(v) = s.strip_suffix("min") {
            Duration::from_secs(parse_num(v)? * 60)
        } else if let Some(v) = s.strip_suffix('h') {
            Duration::from_secs(parse_num(v)? * 3600)
        } else if let Some(v) = s.strip_suffix('s') {
            Duration::from_secs(parse_num(v)?)
        } else {
            Duration::from_secs(parse_num(s)?)
        };

        Ok(ConfigDuration(d))
    }
}

impl Display for ConfigDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ms = self.0.subsec_millis();
        let s = self.0.as_secs();
        if ms > 0 {
            write!(f, "{}ms", ms as u64 + s * 1000)
        } else if s >= 3600 && s % 3600 == 0 {
            write!(f, "{}h", s / 3600)
        } else if s >= 60 && s % 60 == 0 {
            write!(f, "{}min", s / 60)
        } else {
            write!(f, "{}s", s)
        }
    }
}
