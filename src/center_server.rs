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
// Created Date: 2023/09/25 10:08:56

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};

use crate::{
    pool::{BufferPool, WriteBufferPool},
    HealthCheck, MuxConfig, MuxStream, ProxyError, ProxyResult, Session,
};

/// 下游服务, 接管服务端收到的流
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, stream: MuxStream) -> ProxyResult<()>;
}

/// 中心服务端
/// 把每个接入的连接包装成服务端会话, 会话上收到的每个流交给下游服务,
/// 未配置下游服务时转发给轮询选出的上游
pub struct CenterServer {
    config: MuxConfig,
    forward: Vec<SocketAddr>,
    next: AtomicUsize,
    handler: Option<Arc<dyn StreamHandler>>,
    connect_timeout: Option<Duration>,
    pool: Arc<BufferPool>,
    write_pool: Arc<WriteBufferPool>,
    sessions: Mutex<Vec<Session>>,
}

impl CenterServer {
    pub fn new(config: MuxConfig, forward: Vec<SocketAddr>) -> Self {
        // 多个进程同时启动时避免都从第一个上游开始
        let start = if forward.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..forward.len())
        };
        let pool = Arc::new(BufferPool::new(config.pool_classes.clone()));
        Self {
            config,
            forward,
            next: AtomicUsize::new(start),
            handler: None,
            connect_timeout: None,
            pool,
            write_pool: Arc::new(WriteBufferPool::new()),
            sessions: Mutex::new(vec![]),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn StreamHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 接管一个新的底层连接
    pub fn serve<T>(self: &Arc<Self>, conn: T) -> ProxyResult<Session>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = Session::new(
            conn,
            self.config.clone(),
            false,
            self.pool.clone(),
            self.write_pool.clone(),
        )?;
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|s| !s.is_closed());
            sessions.push(session.clone());
        }
        let server = self.clone();
        let accept = session.clone();
        tokio::spawn(async move {
            server.accept_loop(accept).await;
        });
        Ok(session)
    }

    async fn accept_loop(self: Arc<Self>, session: Session) {
        loop {
            match session.accept_stream().await {
                Ok(stream) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        let sid = stream.id();
                        if let Err(e) = server.deal_stream(stream).await {
                            log::debug!("处理流sid={}失败, 原因: {}", sid, e);
                        }
                    });
                }
                Err(e) => {
                    log::debug!("会话结束, 停止接收新流: {}", e);
                    break;
                }
            }
        }
    }

    async fn deal_stream(&self, stream: MuxStream) -> ProxyResult<()> {
        if let Some(handler) = &self.handler {
            return handler.handle(stream).await;
        }
        self.transfer_upstream(stream).await
    }

    /// 从上次的位置开始轮询, 跳过被健康检查标记为失败的上游
    pub fn pick_upstream(&self) -> Option<SocketAddr> {
        let len = self.forward.len();
        if len == 0 {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..len)
            .map(|i| self.forward[(start + i) % len])
            .find(|addr| !HealthCheck::is_fall_down(addr))
    }

    async fn transfer_upstream(&self, mut stream: MuxStream) -> ProxyResult<()> {
        let addr = self
            .pick_upstream()
            .ok_or(ProxyError::Extension("没有可用的上游地址"))?;
        let mut outbound = HealthCheck::connect_timeout(&addr, self.connect_timeout).await?;
        match copy_bidirectional(&mut stream, &mut outbound).await {
            Ok((up, down)) => {
                log::trace!(
                    "流sid={}转发{}完成, 上行{}字节, 下行{}字节",
                    stream.id(),
                    addr,
                    up,
                    down
                );
                HealthCheck::add_rise_up(addr);
                Ok(())
            }
            Err(e) => {
                // 多路复用一侧出错时上游并无问题
                if stream.error().is_none() {
                    HealthCheck::add_fall_down(addr);
                }
                Err(e.into())
            }
        }
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.lock().iter().filter(|s| !s.is_closed()).count()
    }

    pub fn close_all(&self) {
        for session in self.sessions.lock().drain(..) {
            session.close();
        }
    }
}
