use std::{fmt::Display, str::FromStr};

use log::LevelFilter;

use crate::ProxyError;

/// 日志文件配置, 格式如"logs/wmsmux.log info", 未写等级默认为info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLog {
    pub path: String,
    pub level: LevelFilter,
}

impl ConfigLog {
    pub fn new(path: String, level: LevelFilter) -> Self {
        Self { path, level }
    }
}

impl Display for ConfigLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.path, self.level.as_str().to_lowercase())
    }
}

impl FromStr for ConfigLog {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v: Vec<&str> = s.split_whitespace().collect();
        match v.len() {
            1 => Ok(Self::new(v[0].to_string(), LevelFilter::Info)),
            2 => {
                let level = LevelFilter::from_str(v[1])
                    .map_err(|_| ProxyError::Extension("未知的日志等级"))?;
                Ok(Self::new(v[0].to_string(), level))
            }
            _ => Err(ProxyError::Extension("日志配置格式为\"路径 等级\"")),
        }
    }
}
