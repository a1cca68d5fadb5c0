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
// Created Date: 2023/09/22 10:28:41

use std::{
    fmt::{self, Display},
    io,
};

/// 多路复用及代理相关的错误
#[derive(Debug)]
pub enum ProxyError {
    /// 底层连接读写错误, 对Session来说是致命的
    IoError(io::Error),
    /// 未知的帧命令
    UnknownCmd(u8),
    /// 协议版本与当前会话不一致
    VersionNotMatch(u8),
    /// 帧长度超出允许的最大值
    FrameTooLarge(usize),
    /// 对端发送的数据超出了流控窗口
    FlowControl(u32),
    /// 其它格式错误
    ProtErr(&'static str),
    /// 会话已不在ESTABLISHED状态, 无法再创建流
    SessionClosed,
    /// 流id已耗尽
    StreamIdExhausted,
    /// 本地写端已关闭
    BrokenPipe,
    /// 心跳超时
    Timeout,
    Extension(&'static str),
}

impl ProxyError {
    /// 是否属于协议解析类错误
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ProxyError::UnknownCmd(_)
                | ProxyError::VersionNotMatch(_)
                | ProxyError::FrameTooLarge(_)
                | ProxyError::FlowControl(_)
                | ProxyError::ProtErr(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout)
    }

    pub fn to_io(&self) -> io::Error {
        let kind = match self {
            ProxyError::IoError(e) => e.kind(),
            ProxyError::SessionClosed => io::ErrorKind::ConnectionAborted,
            ProxyError::StreamIdExhausted => io::ErrorKind::Other,
            ProxyError::BrokenPipe => io::ErrorKind::BrokenPipe,
            ProxyError::Timeout => io::ErrorKind::TimedOut,
            ProxyError::Extension(_) => io::ErrorKind::Other,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, self.to_string())
    }
}

impl Clone for ProxyError {
    fn clone(&self) -> Self {
        match self {
            Self::IoError(e) => Self::IoError(io::Error::new(e.kind(), e.to_string())),
            Self::UnknownCmd(v) => Self::UnknownCmd(*v),
            Self::VersionNotMatch(v) => Self::VersionNotMatch(*v),
            Self::FrameTooLarge(v) => Self::FrameTooLarge(*v),
            Self::FlowControl(v) => Self::FlowControl(*v),
            Self::ProtErr(s) => Self::ProtErr(s),
            Self::SessionClosed => Self::SessionClosed,
            Self::StreamIdExhausted => Self::StreamIdExhausted,
            Self::BrokenPipe => Self::BrokenPipe,
            Self::Timeout => Self::Timeout,
            Self::Extension(s) => Self::Extension(s),
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<io::Error> for ProxyError {
    fn from(value: io::Error) -> Self {
        ProxyError::IoError(value)
    }
}

impl From<ProxyError> for io::Error {
    fn from(value: ProxyError) -> Self {
        match value {
            ProxyError::IoError(e) => e,
            e => e.to_io(),
        }
    }
}

impl Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(e) => write!(f, "io error: {}", e),
            Self::UnknownCmd(c) => write!(f, "unknown frame cmd {}", c),
            Self::VersionNotMatch(v) => write!(f, "frame version {} not match", v),
            Self::FrameTooLarge(l) => write!(f, "frame length {} too large", l),
            Self::FlowControl(sid) => write!(f, "stream {} exceed receive window", sid),
            Self::ProtErr(s) => write!(f, "protocol error: {}", s),
            Self::SessionClosed => write!(f, "session closed"),
            Self::StreamIdExhausted => write!(f, "stream id exhausted"),
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::Timeout => write!(f, "keepalive timeout"),
            Self::Extension(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for ProxyError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kind() {
        assert_eq!(ProxyError::Timeout.to_io().kind(), io::ErrorKind::TimedOut);
        assert_eq!(ProxyError::BrokenPipe.to_io().kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(ProxyError::UnknownCmd(9).to_io().kind(), io::ErrorKind::InvalidData);
        let err: io::Error = ProxyError::SessionClosed.into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(ProxyError::FlowControl(1).is_protocol());
        assert!(!ProxyError::Extension("配置错误").is_protocol());
    }
}
