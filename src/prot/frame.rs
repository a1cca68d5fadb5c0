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
// Created Date: 2023/09/22 10:30:10

use crate::{pool::BufferPool, ProxyError, ProxyResult};

use super::{ProtCmd, TrafficClass};

/// 帧头: ver(1) | cmd(1) | sid(4) | length(2), 网络字节序
pub const FRAME_HEADER_BYTES: usize = 8;

/// length字段所能表示的最大长度
pub const MAX_FRAME_LENGTH: usize = u16::MAX as usize;

const WINDOW_UPDATE_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtFrameHeader {
    pub version: u8,
    pub cmd: ProtCmd,
    pub sid: u32,
    pub length: u16,
}

impl ProtFrameHeader {
    pub fn new(version: u8, cmd: ProtCmd, sid: u32) -> ProtFrameHeader {
        ProtFrameHeader {
            version,
            cmd,
            sid,
            length: 0,
        }
    }

    /// 数据不足一个帧头时返回None
    #[inline]
    pub fn parse(data: &[u8]) -> ProxyResult<Option<ProtFrameHeader>> {
        if data.len() < FRAME_HEADER_BYTES {
            return Ok(None);
        }
        let cmd = ProtCmd::new(data[1]).ok_or(ProxyError::UnknownCmd(data[1]))?;
        let sid = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let length = u16::from_be_bytes([data[6], data[7]]);
        Ok(Some(ProtFrameHeader {
            version: data[0],
            cmd,
            sid,
            length,
        }))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        buf.push(self.version);
        buf.push(self.cmd.encode());
        buf.extend_from_slice(&self.sid.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
        FRAME_HEADER_BYTES
    }
}

/// 线上传输的最小单元
#[derive(Debug, PartialEq, Eq)]
pub struct ProtFrame {
    version: u8,
    cmd: ProtCmd,
    sid: u32,
    data: Vec<u8>,
}

impl ProtFrame {
    pub fn new(version: u8, cmd: ProtCmd, sid: u32, data: Vec<u8>) -> ProtFrame {
        ProtFrame {
            version,
            cmd,
            sid,
            data,
        }
    }

    pub fn new_open(version: u8, sid: u32) -> ProtFrame {
        Self::new(version, ProtCmd::Open, sid, vec![])
    }

    pub fn new_data(version: u8, sid: u32, data: Vec<u8>) -> ProtFrame {
        Self::new(version, ProtCmd::Data, sid, data)
    }

    pub fn new_close(version: u8, sid: u32) -> ProtFrame {
        Self::new(version, ProtCmd::Close, sid, vec![])
    }

    pub fn new_keepalive(version: u8) -> ProtFrame {
        Self::new(version, ProtCmd::KeepAlive, 0, vec![])
    }

    pub fn new_window_update(version: u8, sid: u32, increment: u32) -> ProtFrame {
        Self::new(
            version,
            ProtCmd::WindowUpdate,
            sid,
            increment.to_be_bytes().to_vec(),
        )
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn cmd(&self) -> ProtCmd {
        self.cmd
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn class(&self) -> TrafficClass {
        self.cmd.class()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_BYTES + self.data.len()
    }

    /// 窗口更新所归还的字节数
    pub fn window_increment(&self) -> ProxyResult<u32> {
        if self.cmd != ProtCmd::WindowUpdate || self.data.len() != WINDOW_UPDATE_BYTES {
            return Err(ProxyError::ProtErr("invalid window update"));
        }
        Ok(u32::from_be_bytes([
            self.data[0],
            self.data[1],
            self.data[2],
            self.data[3],
        ]))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> ProxyResult<usize> {
        if self.data.len() > MAX_FRAME_LENGTH {
            return Err(ProxyError::FrameTooLarge(self.data.len()));
        }
        let mut head = ProtFrameHeader::new(self.version, self.cmd, self.sid);
        head.length = self.data.len() as u16;
        let mut size = 0;
        size += head.encode(buf);
        buf.extend_from_slice(&self.data);
        size += self.data.len();
        log::trace!(
            "多路复用: 编码帧 cmd={:?} sid={} 长度={}",
            self.cmd,
            self.sid,
            self.data.len()
        );
        Ok(size)
    }

    /// 流式解码, 数据不足一帧时返回None且不消耗任何字节,
    /// 成功时返回帧及所消耗的字节数, 负载从缓冲池中分配
    pub fn decode(
        data: &[u8],
        max_frame_size: usize,
        pool: &BufferPool,
    ) -> ProxyResult<Option<(ProtFrame, usize)>> {
        let header = match ProtFrameHeader::parse(data)? {
            Some(header) => header,
            None => return Ok(None),
        };
        let length = header.length as usize;
        if length > max_frame_size {
            return Err(ProxyError::FrameTooLarge(length));
        }
        if header.cmd == ProtCmd::WindowUpdate && length != WINDOW_UPDATE_BYTES {
            return Err(ProxyError::ProtErr("invalid window update"));
        }
        let all_len = FRAME_HEADER_BYTES + length;
        if data.len() < all_len {
            return Ok(None);
        }
        let mut payload = pool.get(length);
        payload.copy_from_slice(&data[FRAME_HEADER_BYTES..all_len]);
        Ok(Some((
            ProtFrame::new(header.version, header.cmd, header.sid, payload),
            all_len,
        )))
    }
}
