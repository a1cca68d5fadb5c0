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

use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    dialer::Dialer,
    pool::{BufferPool, WriteBufferPool},
    MuxConfig, MuxStream, ProxyResult, Session,
};

/// 中心客户端
/// 每个上游地址复用一个会话, 每条逻辑连接在会话上打开一个流,
/// 会话失效时丢弃并重建一次
pub struct CenterClient {
    dialer: Arc<dyn Dialer>,
    config: MuxConfig,
    /// 所有会话共享的缓冲池
    pool: Arc<BufferPool>,
    write_pool: Arc<WriteBufferPool>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl CenterClient {
    pub fn new(dialer: Arc<dyn Dialer>, config: MuxConfig) -> Self {
        let pool = Arc::new(BufferPool::new(config.pool_classes.clone()));
        Self {
            dialer,
            config,
            pool,
            write_pool: Arc::new(WriteBufferPool::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn create_session(&self, addr: &str) -> ProxyResult<Session> {
        let conn = self.dialer.dial(addr).await?;
        log::info!("与服务端{addr}建立多路复用会话");
        Session::new(
            conn,
            self.config.clone(),
            true,
            self.pool.clone(),
            self.write_pool.clone(),
        )
    }

    /// 打开一条到addr的逻辑连接
    pub async fn dial(&self, addr: &str) -> ProxyResult<MuxStream> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(addr) {
            match session.open_stream() {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    log::info!("与服务端{addr}的会话已失效({}), 重新建立", e);
                    session.close();
                    sessions.remove(addr);
                }
            }
        }

        let session = self.create_session(addr).await?;
        let stream = session.open_stream()?;
        sessions.insert(addr.to_string(), session);
        Ok(stream)
    }

    /// 当前缓存的会话数
    pub async fn num_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (addr, session) in sessions.drain() {
            log::trace!("关闭与服务端{addr}的会话");
            session.close();
        }
    }
}
