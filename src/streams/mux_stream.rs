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
// Created Date: 2023/10/13 15:40:08

use std::{
    cmp::min,
    collections::VecDeque,
    fmt::Debug,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{pool::BufferPool, prot::ProtFrame, ProxyError, ProxyResult};

use super::{
    session::SessionInner,
    state::{StreamFlag, StreamState},
};

pub(crate) struct StreamInner {
    flag: StreamFlag,
    /// 已收到但还未被读取的数据块
    recv: VecDeque<Vec<u8>>,
    /// 第一个数据块已读取的位置
    recv_pos: usize,
    /// 未读取的总字节数
    buffered: usize,
    /// 已读取但还未通告对端的字节数
    consumed: usize,
    /// 当前还允许发送的字节数
    send_window: usize,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    err: Option<ProxyError>,
}

/// 会话与流共享的状态, 会话的读协程往里写入, 流的读写在此等待
pub(crate) struct StreamShared {
    id: u32,
    inner: Mutex<StreamInner>,
}

fn wake(wakers: [Option<Waker>; 2]) {
    for waker in wakers.into_iter().flatten() {
        waker.wake();
    }
}

impl StreamShared {
    pub fn new(id: u32, send_window: usize) -> Self {
        Self {
            id,
            inner: Mutex::new(StreamInner {
                flag: StreamFlag::OPENED,
                recv: VecDeque::new(),
                recv_pos: 0,
                buffered: 0,
                consumed: 0,
                send_window,
                read_waker: None,
                write_waker: None,
                err: None,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn flag(&self) -> StreamFlag {
        self.inner.lock().flag
    }

    /// 收到对端的数据, 超出接收窗口视为协议错误
    pub fn push_data(&self, data: Vec<u8>, window: usize, pool: &BufferPool) -> ProxyResult<()> {
        if data.is_empty() {
            pool.put(data);
            return Ok(());
        }
        let waker = {
            let mut inner = self.inner.lock();
            if inner.flag.is_remote_closed() || inner.err.is_some() {
                drop(inner);
                pool.put(data);
                return Ok(());
            }
            if inner.buffered + inner.consumed + data.len() > window {
                drop(inner);
                pool.put(data);
                return Err(ProxyError::FlowControl(self.id));
            }
            inner.buffered += data.len();
            inner.recv.push_back(data);
            inner.read_waker.take()
        };
        wake([waker, None]);
        Ok(())
    }

    /// 收到对端的Close, 返回是否两端均已关闭
    /// 已半关闭的流再次收到Close表示对端已丢弃该流
    pub fn remote_close(&self) -> bool {
        let (closed, wakers) = {
            let mut inner = self.inner.lock();
            if inner.flag.is_remote_closed() {
                log::trace!("多路复用: 对端丢弃流 sid={}", self.id);
                inner.flag.insert(StreamFlag::RESET);
            }
            inner.flag.insert(StreamFlag::REMOTE_CLOSED);
            (
                inner.flag.is_closed(),
                [inner.read_waker.take(), inner.write_waker.take()],
            )
        };
        wake(wakers);
        closed
    }

    /// 对端归还发送窗口
    pub fn add_window(&self, increment: u32) {
        let waker = {
            let mut inner = self.inner.lock();
            inner.send_window = inner.send_window.saturating_add(increment as usize);
            inner.write_waker.take()
        };
        wake([waker, None]);
    }

    /// 会话出现致命错误, 唤醒所有等待者
    pub fn fail(&self, err: ProxyError) {
        let wakers = {
            let mut inner = self.inner.lock();
            if inner.err.is_none() {
                inner.err = Some(err);
            }
            [inner.read_waker.take(), inner.write_waker.take()]
        };
        wake(wakers);
    }

    /// 关闭本地写端, 返回(是否需要发送Close, 是否两端均已关闭)
    fn local_close(&self) -> (bool, bool) {
        let mut inner = self.inner.lock();
        if inner.flag.is_local_closed() {
            return (false, inner.flag.is_closed());
        }
        inner.flag.insert(StreamFlag::LOCAL_CLOSED);
        (inner.err.is_none(), inner.flag.is_closed())
    }

    /// 丢弃前判断对端是否可能还在写入, 是则需要通知对端停止发送
    fn abandon(&self) -> bool {
        let inner = self.inner.lock();
        !inner.flag.is_remote_closed() && inner.err.is_none()
    }

    fn detach(&self) {
        self.inner.lock().flag.insert(StreamFlag::REMOTE_CLOSED);
    }

    /// 释放所有未读的数据
    fn release(&self, pool: &BufferPool) {
        let mut inner = self.inner.lock();
        inner.buffered = 0;
        inner.recv_pos = 0;
        while let Some(data) = inner.recv.pop_front() {
            pool.put(data);
        }
    }
}

/// 多路复用下的一个逻辑流
/// 实现AsyncRead及AsyncWrite, 可以和普通的连接一样读写,
/// shutdown只关闭写端, 关闭后依然可以读取对端剩余的数据
pub struct MuxStream {
    shared: Arc<StreamShared>,
    session: Arc<SessionInner>,
}

impl MuxStream {
    pub(crate) fn new(shared: Arc<StreamShared>, session: Arc<SessionInner>) -> Self {
        Self { shared, session }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn state(&self) -> StreamState {
        self.shared.flag().state()
    }

    /// 流或会话出错时返回对应的错误, 对端丢弃该流时返回BrokenPipe
    pub fn error(&self) -> Option<ProxyError> {
        let inner = self.shared.inner.lock();
        match &inner.err {
            Some(err) => Some(err.clone()),
            None if inner.flag.is_reset() => Some(ProxyError::BrokenPipe),
            None => None,
        }
    }

    /// 关闭本地写端并通知对端
    pub fn close(&self) {
        let (send, closed) = self.shared.local_close();
        if send {
            log::trace!("多路复用: 关闭流 sid={}", self.id());
            self.session
                .send_frame(ProtFrame::new_close(self.session.version(), self.id()));
        }
        if closed {
            self.session.remove_stream(self.id());
        }
    }
}

impl Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl AsyncRead for MuxStream {
    // 有数据则优先返回数据, 对端关闭且数据读完返回0表示结束
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let window = this.session.config.max_stream_buffer();
        let update = {
            let mut guard = this.shared.inner.lock();
            let inner = &mut *guard;
            if inner.buffered == 0 {
                if let Some(err) = &inner.err {
                    return Poll::Ready(Err(err.to_io()));
                }
                if inner.flag.is_remote_closed() {
                    return Poll::Ready(Ok(()));
                }
                inner.read_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }

            let mut copied = 0;
            while buf.remaining() > 0 {
                let front = match inner.recv.front() {
                    Some(front) => front,
                    None => break,
                };
                let front_len = front.len();
                let n = min(front_len - inner.recv_pos, buf.remaining());
                buf.put_slice(&front[inner.recv_pos..inner.recv_pos + n]);
                inner.recv_pos += n;
                copied += n;
                if inner.recv_pos == front_len {
                    inner.recv_pos = 0;
                    if let Some(data) = inner.recv.pop_front() {
                        this.session.pool.put(data);
                    }
                }
            }
            inner.buffered -= copied;
            inner.consumed += copied;
            // 读取超过半个窗口时归还给对端
            if inner.consumed >= window / 2 && !inner.flag.is_remote_closed() {
                let consumed = inner.consumed;
                inner.consumed = 0;
                Some(consumed as u32)
            } else {
                None
            }
        };
        if let Some(increment) = update {
            this.session.send_frame(ProtFrame::new_window_update(
                this.session.version(),
                this.id(),
                increment,
            ));
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    /// 受发送窗口限制, 窗口为0时等待对端的窗口更新
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = {
            let mut inner = this.shared.inner.lock();
            if let Some(err) = &inner.err {
                return Poll::Ready(Err(err.to_io()));
            }
            if inner.flag.is_local_closed() || inner.flag.is_reset() {
                return Poll::Ready(Err(ProxyError::BrokenPipe.to_io()));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            if inner.send_window == 0 {
                inner.write_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let n = min(
                min(buf.len(), inner.send_window),
                this.session.config.max_frame_size(),
            );
            inner.send_window -= n;
            n
        };
        let mut data = this.session.pool.get(n);
        data.copy_from_slice(&buf[..n]);
        this.session
            .send_frame(ProtFrame::new_data(this.session.version(), this.id(), data));
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &self.shared.inner.lock().err {
            Some(err) => Poll::Ready(Err(err.to_io())),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let abandon = self.shared.abandon();
        self.close();
        if abandon {
            // 第二个Close, 让对端阻塞在窗口上的写入立即失败
            self.session
                .send_frame(ProtFrame::new_close(self.session.version(), self.id()));
        }
        // 不再读取, 对端后续的数据直接丢弃
        self.shared.detach();
        self.session.remove_stream(self.id());
        self.shared.release(&self.session.pool);
    }
}
