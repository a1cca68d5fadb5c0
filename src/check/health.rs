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
// Created Date: 2023/10/09 05:12:55

use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, ToSocketAddrs},
    time::{Duration, Instant},
};

use lazy_static::lazy_static;
use parking_lot::RwLock;
use tokio::net::TcpStream;

lazy_static! {
    static ref HEALTH_CHECK: RwLock<HealthCheck> = RwLock::new(HealthCheck::new(60, 3, 2));
}

/// 每个上游地址的记录值
struct HealthRecord {
    /// 最后的记录时间
    last_record: Instant,
    /// 当前连续失败的次数
    fall_times: usize,
    /// 当前连续成功的次数
    rise_times: usize,
    /// 当前是否被标记为不可用
    failed: bool,
}

impl HealthRecord {
    pub fn new() -> Self {
        Self {
            last_record: Instant::now(),
            fall_times: 0,
            rise_times: 0,
            failed: false,
        }
    }

    pub fn clear_status(&mut self) {
        self.fall_times = 0;
        self.rise_times = 0;
        self.failed = false;
    }
}

/// 被动健康检查
/// 连接或转发的结果由调用方上报, 连续失败达到次数的地址在一段时间内被跳过
pub struct HealthCheck {
    /// 失败状态的持续时间, 超过后重新计算
    fail_timeout: Duration,
    /// 连续失败达到该次数则认为不可访问
    max_fails: usize,
    /// 连续成功达到该次数则认为恢复
    min_rises: usize,
    health_map: HashMap<SocketAddr, HealthRecord>,
}

impl HealthCheck {
    pub fn new(fail_timeout: u64, max_fails: usize, min_rises: usize) -> Self {
        Self {
            fail_timeout: Duration::from_secs(fail_timeout),
            max_fails: max_fails.max(1),
            min_rises: min_rises.max(1),
            health_map: HashMap::new(),
        }
    }

    /// 检测地址当前是否不可用
    pub fn is_fall_down(addr: &SocketAddr) -> bool {
        let h = HEALTH_CHECK.read();
        match h.health_map.get(addr) {
            Some(value) => {
                if value.last_record.elapsed() > h.fail_timeout {
                    return false;
                }
                value.failed
            }
            None => false,
        }
    }

    /// 失败时调用
    pub fn add_fall_down(addr: SocketAddr) {
        let mut h = HEALTH_CHECK.write();
        let (fail_timeout, max_fails) = (h.fail_timeout, h.max_fails);
        let value = h.health_map.entry(addr).or_insert_with(HealthRecord::new);
        // 超出失败时长，重新计算状态
        if value.last_record.elapsed() > fail_timeout {
            value.clear_status();
        }
        value.last_record = Instant::now();
        value.fall_times += 1;
        value.rise_times = 0;
        if value.fall_times >= max_fails {
            if !value.failed {
                log::warn!("上游{addr}连续失败{}次, 暂时标记为不可用", value.fall_times);
            }
            value.failed = true;
        }
    }

    /// 成功时调用
    pub fn add_rise_up(addr: SocketAddr) {
        let mut h = HEALTH_CHECK.write();
        let (fail_timeout, min_rises) = (h.fail_timeout, h.min_rises);
        let value = h.health_map.entry(addr).or_insert_with(HealthRecord::new);
        if value.last_record.elapsed() > fail_timeout {
            value.clear_status();
        }
        value.last_record = Instant::now();
        value.rise_times += 1;
        value.fall_times = 0;
        if value.rise_times >= min_rises {
            value.failed = false;
        }
    }

    // 将TcpStream::connect函数替换成这个函数，将自动启用被动健康检查
    pub async fn connect<A>(addr: &A) -> io::Result<TcpStream>
    where
        A: ToSocketAddrs,
    {
        let addrs = addr.to_socket_addrs()?;
        let mut last_err = None;

        for addr in addrs {
            // 健康检查失败，直接返回错误
            if Self::is_fall_down(&addr) {
                last_err = Some(io::Error::new(io::ErrorKind::Other, "health check falldown"));
                continue;
            }
            log::trace!("尝试与远端{addr}建立连接");
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    if let Ok(local) = stream.local_addr() {
                        log::trace!("成功与远端{addr}建立连接:{local}->{addr}");
                    }
                    let _ = stream.set_nodelay(true);
                    Self::add_rise_up(addr);
                    return Ok(stream);
                }
                Err(e) => {
                    log::trace!("与远端{addr}建立连接失败, 原因: {:?}", e);
                    Self::add_fall_down(addr);
                    last_err = Some(e)
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "could not resolve to any address",
            )
        }))
    }

    /// 带超时的连接, 超时也记为一次失败
    pub async fn connect_timeout<A>(addr: &A, connect: Option<Duration>) -> io::Result<TcpStream>
    where
        A: ToSocketAddrs,
    {
        match connect {
            None => HealthCheck::connect(addr).await,
            Some(timeout) => match tokio::time::timeout(timeout, HealthCheck::connect(addr)).await {
                Ok(s) => s,
                Err(_) => {
                    if let Ok(addrs) = addr.to_socket_addrs() {
                        addrs.for_each(Self::add_fall_down);
                    }
                    Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fall_and_rise() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(!HealthCheck::is_fall_down(&addr));
        for _ in 0..3 {
            HealthCheck::add_fall_down(addr);
        }
        assert!(HealthCheck::is_fall_down(&addr));
        HealthCheck::add_rise_up(addr);
        assert!(HealthCheck::is_fall_down(&addr));
        HealthCheck::add_rise_up(addr);
        assert!(!HealthCheck::is_fall_down(&addr));
    }
}
