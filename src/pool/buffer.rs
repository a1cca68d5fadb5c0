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
// Created Date: 2023/10/12 09:31:20

use crossbeam_queue::ArrayQueue;

/// 默认的分级大小, 从1字节到64k
pub const DEFAULT_POOL_CLASSES: [usize; 17] = [
    1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536,
];

/// 每一级最多缓存的字节数
const CLASS_RETAIN_BYTES: usize = 4 * 1024 * 1024;

/// 分级字节池
///
/// 获取时选取不小于请求长度的最小分级, 返回的长度恰好为请求长度;
/// 归还时只认容量, 容量与某一级完全相等才回收, 否则直接丢弃交给系统释放,
/// 这样永远不会把大小不符的内存放错级别.
pub struct BufferPool {
    sizes: Vec<usize>,
    pools: Vec<ArrayQueue<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(mut sizes: Vec<usize>) -> Self {
        sizes.retain(|s| *s > 0);
        sizes.sort_unstable();
        sizes.dedup();
        let pools = sizes
            .iter()
            .map(|s| ArrayQueue::new((CLASS_RETAIN_BYTES / s).clamp(16, 1024)))
            .collect();
        Self { sizes, pools }
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// 最大的分级
    pub fn max_class(&self) -> usize {
        self.sizes.last().copied().unwrap_or(0)
    }

    /// 获取长度恰好为`size`的缓冲
    /// 超出最大分级时直接分配, 该缓冲归还时会被丢弃
    pub fn get(&self, size: usize) -> Vec<u8> {
        let idx = self.sizes.partition_point(|s| *s < size);
        if idx >= self.sizes.len() {
            log::trace!("缓冲池: 请求长度{}超出最大分级, 直接分配", size);
            return vec![0u8; size];
        }
        match self.pools[idx].pop() {
            Some(mut buf) => {
                buf.resize(size, 0);
                buf
            }
            None => {
                let mut buf = vec![0u8; self.sizes[idx]];
                buf.truncate(size);
                buf
            }
        }
    }

    /// 归还缓冲, 调用后不得再使用该缓冲
    pub fn put(&self, buf: Vec<u8>) {
        if let Ok(idx) = self.sizes.binary_search(&buf.capacity()) {
            // 满了就丢弃
            let _ = self.pools[idx].push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CLASSES.to_vec())
    }
}
