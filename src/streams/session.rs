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
// Created Date: 2023/10/13 16:21:37

use std::{
    collections::HashMap,
    fmt::Debug,
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{
    io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc::{channel, Receiver, Sender},
};
use tokio_util::sync::CancellationToken;
use webparse::{BinaryMut, BufMut};

use crate::{
    pool::{BufferPool, WriteBufferPool, MAX_WRITE_BUFFER},
    prot::{ProtCmd, ProtFrame},
    Helper, MuxConfig, ProxyError, ProxyResult,
};

use super::{
    mux_stream::{MuxStream, StreamShared},
    shaper::{Shaper, WriteRequest},
    state::SessionState,
};

/// 每次从底层连接读取的最大字节数
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 关闭写端时最多等待的时长
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

struct SessionStatus {
    state: SessionState,
    /// 第一个导致会话结束的错误
    err: Option<ProxyError>,
    /// 下一个本端分配的流id
    next_id: u32,
}

pub(crate) struct SessionInner {
    pub(crate) config: MuxConfig,
    pub(crate) pool: Arc<BufferPool>,
    write_pool: Arc<WriteBufferPool>,
    shaper: Shaper,
    is_client: bool,
    status: Mutex<SessionStatus>,
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
    token: CancellationToken,
    accept_sender: Sender<Arc<StreamShared>>,
    accept_receiver: tokio::sync::Mutex<Receiver<Arc<StreamShared>>>,
    last_recv: Mutex<Instant>,
    last_send: Mutex<Instant>,
}

impl SessionInner {
    pub(crate) fn version(&self) -> u8 {
        self.config.version
    }

    /// 提交一个待写出的帧, 会话结束后直接丢弃
    pub(crate) fn send_frame(&self, frame: ProtFrame) {
        if self.token.is_cancelled() {
            self.pool.put(frame.into_data());
            return;
        }
        self.shaper.enqueue(frame);
    }

    pub(crate) fn remove_stream(&self, sid: u32) {
        if self.streams.lock().remove(&sid).is_some() {
            log::trace!("多路复用: 移除流 sid={}", sid);
        }
    }

    fn get_stream(&self, sid: u32) -> Option<Arc<StreamShared>> {
        self.streams.lock().get(&sid).cloned()
    }

    fn last_error(&self) -> ProxyError {
        self.status
            .lock()
            .err
            .clone()
            .unwrap_or(ProxyError::SessionClosed)
    }

    /// 会话出现致命错误, 只有第一个错误会被记录, 之后所有的流均收到该错误
    fn notify_error(&self, err: ProxyError) {
        {
            let mut status = self.status.lock();
            if status.state != SessionState::Established {
                return;
            }
            status.state = SessionState::Closing;
            status.err = Some(err.clone());
        }
        match &err {
            ProxyError::SessionClosed => log::debug!("多路复用: 主动关闭会话"),
            _ => log::warn!("多路复用: 会话异常关闭, 原因: {}", err),
        }
        self.token.cancel();

        let streams: Vec<Arc<StreamShared>> = self.streams.lock().drain().map(|(_, v)| v).collect();
        for stream in streams {
            stream.fail(err.clone());
        }
        self.drain_shaper();
    }

    fn drain_shaper(&self) {
        for req in self.shaper.drain() {
            self.pool.put(req.frame.into_data());
        }
    }

    fn finish(&self) {
        self.drain_shaper();
        self.status.lock().state = SessionState::Closed;
        log::trace!("多路复用: 会话已关闭");
    }

    /// 在会话正常时才允许登记新的流
    fn register_stream(&self, shared: Arc<StreamShared>) -> bool {
        let status = self.status.lock();
        if status.state != SessionState::Established {
            return false;
        }
        self.streams.lock().insert(shared.id(), shared);
        true
    }

    fn open_stream(&self) -> ProxyResult<Arc<StreamShared>> {
        let shared = {
            let mut status = self.status.lock();
            if status.state != SessionState::Established {
                return Err(ProxyError::SessionClosed);
            }
            let sid = status.next_id;
            status.next_id = sid.checked_add(2).ok_or(ProxyError::StreamIdExhausted)?;
            let shared = Arc::new(StreamShared::new(sid, self.config.max_stream_buffer()));
            self.streams.lock().insert(sid, shared.clone());
            shared
        };
        log::trace!("多路复用: 打开流 sid={}", shared.id());
        self.send_frame(ProtFrame::new_open(self.version(), shared.id()));
        Ok(shared)
    }

    fn handle_frame(&self, frame: ProtFrame) -> ProxyResult<()> {
        if frame.version() != self.version() {
            return Err(ProxyError::VersionNotMatch(frame.version()));
        }
        let sid = frame.sid();
        match frame.cmd() {
            ProtCmd::Open => {
                if sid == 0 {
                    return Err(ProxyError::ProtErr("open stream with id 0"));
                }
                if self.get_stream(sid).is_some() {
                    log::debug!("多路复用: 重复打开流 sid={}, 忽略", sid);
                    return Ok(());
                }
                let shared = Arc::new(StreamShared::new(sid, self.config.max_stream_buffer()));
                if !self.register_stream(shared.clone()) {
                    return Ok(());
                }
                if self.accept_sender.try_send(shared).is_err() {
                    log::warn!("多路复用: 等待accept的流过多, 拒绝流 sid={}", sid);
                    self.remove_stream(sid);
                    // 连续两个Close, 对端的读取结束且写入立即失败
                    self.send_frame(ProtFrame::new_close(self.version(), sid));
                    self.send_frame(ProtFrame::new_close(self.version(), sid));
                } else {
                    log::trace!("多路复用: 收到新流 sid={}", sid);
                }
            }
            ProtCmd::Data => match self.get_stream(sid) {
                Some(stream) => {
                    stream.push_data(
                        frame.into_data(),
                        self.config.max_stream_buffer(),
                        &self.pool,
                    )?;
                }
                None => {
                    log::trace!("多路复用: 数据对应的流不存在 sid={}", sid);
                    self.pool.put(frame.into_data());
                }
            },
            ProtCmd::Close => {
                if let Some(stream) = self.get_stream(sid) {
                    if stream.remote_close() {
                        self.remove_stream(sid);
                    }
                }
            }
            ProtCmd::WindowUpdate => {
                let increment = frame.window_increment()?;
                if let Some(stream) = self.get_stream(sid) {
                    stream.add_window(increment);
                }
                self.pool.put(frame.into_data());
            }
            ProtCmd::KeepAlive => {}
        }
        Ok(())
    }

    fn encode_request(&self, req: WriteRequest, buf: &mut Vec<u8>) -> ProxyResult<()> {
        let ret = req.frame.encode(buf);
        self.pool.put(req.frame.into_data());
        ret.map(|_| ())
    }
}

async fn read_loop<R>(inner: Arc<SessionInner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut read_buf = BinaryMut::new();
    let mut vec = inner.pool.get(READ_BUFFER_SIZE);
    let err = 'outer: loop {
        let r = tokio::select! {
            biased;
            _ = inner.token.cancelled() => None,
            r = reader.read(&mut vec) => Some(r),
        };
        let r = match r {
            Some(r) => r,
            None => {
                inner.pool.put(vec);
                return;
            }
        };
        match r {
            Ok(0) => {
                break ProxyError::IoError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ));
            }
            Ok(n) => {
                *inner.last_recv.lock() = Instant::now();
                read_buf.put_slice(&vec[..n]);
            }
            Err(e) => break e.into(),
        }

        loop {
            match Helper::decode_frame(&mut read_buf, inner.config.max_frame_size(), &inner.pool) {
                Ok(Some(frame)) => {
                    if let Err(e) = inner.handle_frame(frame) {
                        break 'outer e;
                    }
                }
                Ok(None) => break,
                Err(e) => break 'outer e,
            }
        }
    };
    inner.pool.put(vec);
    inner.notify_error(err);
}

async fn write_loop<W>(inner: Arc<SessionInner>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = inner.write_pool.get();
    loop {
        let req = tokio::select! {
            biased;
            _ = inner.token.cancelled() => break,
            req = inner.shaper.dequeue() => req,
        };
        let mut ret = inner.encode_request(req, &mut buf);
        // 合并已经排队的帧, 减少系统调用
        while ret.is_ok() && buf.len() < MAX_WRITE_BUFFER {
            match inner.shaper.try_dequeue() {
                Some(req) => ret = inner.encode_request(req, &mut buf),
                None => break,
            }
        }
        if let Err(e) = ret {
            inner.notify_error(e);
            break;
        }

        let r = tokio::select! {
            biased;
            _ = inner.token.cancelled() => break,
            r = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            } => r,
        };
        buf.clear();
        if let Err(e) = r {
            inner.notify_error(e.into());
            break;
        }
        *inner.last_send.lock() = Instant::now();
    }
    inner.write_pool.put(buf);
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;
    inner.finish();
}

async fn keepalive_loop(inner: Arc<SessionInner>) {
    let interval = inner.config.keep_alive_interval();
    let timeout = inner.config.keep_alive_timeout();
    let mut ticker = tokio::time::interval(interval);
    // 第一次tick立即返回
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = inner.token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if inner.last_recv.lock().elapsed() >= timeout {
            inner.notify_error(ProxyError::Timeout);
            return;
        }
        // 半个周期内没有写出任何数据就发送心跳
        if inner.last_send.lock().elapsed() >= interval / 2 {
            log::trace!("多路复用: 发送心跳");
            inner.send_frame(ProtFrame::new_keepalive(inner.version()));
        }
    }
}

/// 多路复用会话
/// 独占一个底层连接, 在其上创建或接受任意多个逻辑流.
/// 内部有唯一的读协程负责按流id分发数据, 唯一的写协程按优先级写出,
/// 句柄可以任意克隆, 所有克隆共享同一个会话
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// 以客户端的身份包装连接, 本端打开的流id为奇数
    pub fn wrap_client<T>(conn: T, config: MuxConfig) -> ProxyResult<Session>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let pool = Arc::new(BufferPool::new(config.pool_classes.clone()));
        Self::new(conn, config, true, pool, Arc::new(WriteBufferPool::new()))
    }

    /// 以服务端的身份包装连接, 本端打开的流id为偶数
    pub fn wrap_server<T>(conn: T, config: MuxConfig) -> ProxyResult<Session>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let pool = Arc::new(BufferPool::new(config.pool_classes.clone()));
        Self::new(conn, config, false, pool, Arc::new(WriteBufferPool::new()))
    }

    /// 需在tokio运行时中调用, 读写及心跳协程随之启动
    pub fn new<T>(
        conn: T,
        config: MuxConfig,
        is_client: bool,
        pool: Arc<BufferPool>,
        write_pool: Arc<WriteBufferPool>,
    ) -> ProxyResult<Session>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.verify()?;
        let (accept_sender, accept_receiver) = channel(config.accept_backlog);
        let now = Instant::now();
        let inner = Arc::new(SessionInner {
            pool,
            write_pool,
            shaper: Shaper::new(),
            is_client,
            status: Mutex::new(SessionStatus {
                state: SessionState::Established,
                err: None,
                next_id: if is_client { 1 } else { 2 },
            }),
            streams: Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
            accept_sender,
            accept_receiver: tokio::sync::Mutex::new(accept_receiver),
            last_recv: Mutex::new(now),
            last_send: Mutex::new(now),
            config,
        });

        let (reader, writer) = split(conn);
        tokio::spawn(read_loop(inner.clone(), reader));
        tokio::spawn(write_loop(inner.clone(), writer));
        if !inner.config.keep_alive_disabled {
            tokio::spawn(keepalive_loop(inner.clone()));
        }
        log::debug!(
            "多路复用: 创建会话 角色={}",
            if is_client { "client" } else { "server" }
        );
        Ok(Session { inner })
    }

    /// 打开一个新流, 不等待对端确认, 可以立即写入
    pub fn open_stream(&self) -> ProxyResult<MuxStream> {
        let shared = self.inner.open_stream()?;
        Ok(MuxStream::new(shared, self.inner.clone()))
    }

    /// 等待对端打开的流, 会话结束时返回导致结束的错误
    pub async fn accept_stream(&self) -> ProxyResult<MuxStream> {
        let mut receiver = self.inner.accept_receiver.lock().await;
        tokio::select! {
            biased;
            _ = self.inner.token.cancelled() => Err(self.inner.last_error()),
            r = receiver.recv() => match r {
                Some(shared) => Ok(MuxStream::new(shared, self.inner.clone())),
                None => Err(self.inner.last_error()),
            },
        }
    }

    /// 关闭会话, 可重复调用
    pub fn close(&self) {
        self.inner.notify_error(ProxyError::SessionClosed);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// 等待会话结束
    pub async fn closed(&self) {
        self.inner.token.cancelled().await
    }

    pub fn state(&self) -> SessionState {
        self.inner.status.lock().state
    }

    pub fn is_client(&self) -> bool {
        self.inner.is_client
    }

    /// 导致会话结束的错误
    pub fn error(&self) -> Option<ProxyError> {
        self.inner.status.lock().err.clone()
    }

    pub fn num_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("is_client", &self.inner.is_client)
            .field("state", &self.state())
            .field("streams", &self.num_streams())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::streams::StreamState;

    fn test_config() -> MuxConfig {
        let mut config = MuxConfig::default();
        config.keep_alive_disabled = true;
        config
    }

    #[tokio::test]
    async fn test_stream_ids() {
        let (a, b) = duplex(64 * 1024);
        let client = Session::wrap_client(a, test_config()).unwrap();
        let server = Session::wrap_server(b, test_config()).unwrap();
        let ids: Vec<u32> = (0..3).map(|_| client.open_stream().unwrap().id()).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        assert_eq!(server.open_stream().unwrap().id(), 2);
        assert_eq!(server.open_stream().unwrap().id(), 4);
    }

    #[tokio::test]
    async fn test_open_accept_echo() {
        let (a, b) = duplex(64 * 1024);
        let client = Session::wrap_client(a, test_config()).unwrap();
        let server = Session::wrap_server(b, test_config()).unwrap();

        let mut stream = client.open_stream().unwrap();
        stream.write_all(b"hello mux").await.unwrap();
        let mut peer = tokio::time::timeout(Duration::from_secs(1), server.accept_stream())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer.id(), stream.id());
        let mut buf = [0u8; 9];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello mux");

        peer.write_all(b"pong").await.unwrap();
        peer.shutdown().await.unwrap();
        let mut out = vec![];
        tokio::time::timeout(Duration::from_secs(1), stream.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, b"pong");
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (a, _b) = duplex(1024);
        let client = Session::wrap_client(a, test_config()).unwrap();
        client.close();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(client.open_stream(), Err(ProxyError::SessionClosed)));
        assert!(matches!(
            client.accept_stream().await,
            Err(ProxyError::SessionClosed)
        ));
        assert!(matches!(client.error(), Some(ProxyError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_pool_classes_from_config() {
        let (a, b) = duplex(1024);
        let mut config = test_config();
        config.pool_classes = vec![64, 1024, 65536];
        let client = Session::wrap_client(a, config.clone()).unwrap();
        let server = Session::wrap_server(b, config).unwrap();
        assert_eq!(client.inner.pool.sizes(), &[64, 1024, 65536]);
        assert_eq!(server.inner.pool.sizes(), &[64, 1024, 65536]);
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let (a, _b) = duplex(1024);
        let mut config = test_config();
        config.max_frame_size = crate::ConfigSize(0);
        assert!(Session::wrap_client(a, config).is_err());
    }
}
