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
// Created Date: 2023/10/13 11:02:45

use std::{cmp::Ordering, collections::BinaryHeap};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::prot::{ProtFrame, TrafficClass};

/// 等待写出的帧
#[derive(Debug)]
pub struct WriteRequest {
    pub class: TrafficClass,
    pub seq: u64,
    pub frame: ProtFrame,
}

impl WriteRequest {
    pub fn new(class: TrafficClass, seq: u64, frame: ProtFrame) -> Self {
        Self { class, seq, frame }
    }

    pub fn sid(&self) -> u32 {
        self.frame.sid()
    }
}

// BinaryHeap为大顶堆, 优先级越高排序越大: 先比较类型, 同类型序号小的优先
impl Ord for WriteRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .class
            .cmp(&self.class)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for WriteRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for WriteRequest {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class && self.seq == other.seq
    }
}

impl Eq for WriteRequest {}

/// 按优先级排序的写请求堆, 序号由调用方保证唯一
#[derive(Default)]
pub struct ShaperHeap {
    heap: BinaryHeap<WriteRequest>,
}

impl ShaperHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, req: WriteRequest) {
        self.heap.push(req);
    }

    pub fn pop(&mut self) -> Option<WriteRequest> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

struct ShaperInner {
    heap: ShaperHeap,
    next_seq: u64,
}

/// 写调度器
/// 任意多个流并发提交写请求, 唯一的写协程按优先级取出写到底层连接
pub struct Shaper {
    inner: Mutex<ShaperInner>,
    notify: Notify,
}

impl Shaper {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ShaperInner {
                heap: ShaperHeap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// 提交写请求, 不阻塞, 序号在锁内分配保证与入队顺序一致
    pub fn enqueue(&self, frame: ProtFrame) {
        {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(WriteRequest::new(frame.class(), seq, frame));
        }
        self.notify.notify_one();
    }

    pub fn try_dequeue(&self) -> Option<WriteRequest> {
        self.inner.lock().heap.pop()
    }

    /// 只允许唯一的写协程调用, 队列为空时等待
    pub async fn dequeue(&self) -> WriteRequest {
        loop {
            if let Some(req) = self.try_dequeue() {
                return req;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    /// 清空所有未写出的请求
    pub fn drain(&self) -> Vec<WriteRequest> {
        let mut inner = self.inner.lock();
        let mut reqs = Vec::with_capacity(inner.heap.len());
        while let Some(req) = inner.heap.pop() {
            reqs.push(req);
        }
        reqs
    }
}

impl Default for Shaper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    fn req(class: TrafficClass, seq: u64) -> WriteRequest {
        WriteRequest::new(class, seq, ProtFrame::new_data(1, seq as u32 + 1, vec![]))
    }

    #[test]
    fn test_sequence_order() {
        let mut heap = ShaperHeap::new();
        for seq in [3, 1, 4, 0, 2] {
            heap.push(req(TrafficClass::Data, seq));
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop()).map(|r| r.seq).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_control_first() {
        let mut heap = ShaperHeap::new();
        heap.push(req(TrafficClass::Data, 0));
        heap.push(req(TrafficClass::Data, 1));
        heap.push(req(TrafficClass::Control, 2));
        heap.push(req(TrafficClass::Data, 3));
        heap.push(req(TrafficClass::Data, 4));
        heap.push(req(TrafficClass::Control, 5));
        heap.push(req(TrafficClass::Data, 6));
        let order: Vec<(TrafficClass, u64)> =
            std::iter::from_fn(|| heap.pop()).map(|r| (r.class, r.seq)).collect();
        assert_eq!(
            order,
            vec![
                (TrafficClass::Control, 2),
                (TrafficClass::Control, 5),
                (TrafficClass::Data, 0),
                (TrafficClass::Data, 1),
                (TrafficClass::Data, 3),
                (TrafficClass::Data, 4),
                (TrafficClass::Data, 6),
            ]
        );
    }

    #[test]
    fn test_push_order_independent() {
        let items = [
            (TrafficClass::Data, 10),
            (TrafficClass::Control, 7),
            (TrafficClass::Data, 2),
            (TrafficClass::Control, 12),
            (TrafficClass::Data, 5),
            (TrafficClass::Control, 1),
        ];
        let mut heap = ShaperHeap::new();
        for (class, seq) in items.iter().rev() {
            heap.push(req(*class, *seq));
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop()).map(|r| r.seq).collect();
        assert_eq!(order, vec![1, 7, 12, 2, 5, 10]);
    }

    #[test]
    fn test_enqueue_assigns_sequence() {
        let shaper = Shaper::new();
        shaper.enqueue(ProtFrame::new_open(1, 1));
        shaper.enqueue(ProtFrame::new_data(1, 1, b"a".to_vec()));
        shaper.enqueue(ProtFrame::new_keepalive(1));
        shaper.enqueue(ProtFrame::new_close(1, 1));
        shaper.enqueue(ProtFrame::new_window_update(1, 3, 10));
        let cmds: Vec<_> = std::iter::from_fn(|| shaper.try_dequeue())
            .map(|r| r.frame.cmd())
            .collect();
        use crate::prot::ProtCmd::*;
        assert_eq!(cmds, vec![KeepAlive, WindowUpdate, Open, Data, Close]);
    }

    #[tokio::test]
    async fn test_dequeue_wait() {
        let shaper = Arc::new(Shaper::new());
        let clone = shaper.clone();
        let handle = tokio::spawn(async move { clone.dequeue().await.sid() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shaper.enqueue(ProtFrame::new_open(1, 9));
        let sid = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sid, 9);
    }
}
