use crossbeam_queue::ArrayQueue;

/// 超出该容量的缓冲不再回收
pub const MAX_WRITE_BUFFER: usize = 64 * 1024;

const WRITE_POOL_RETAIN: usize = 256;

/// 可增长的写缓冲池, 用于帧编码
pub struct WriteBufferPool {
    pool: ArrayQueue<Vec<u8>>,
}

impl WriteBufferPool {
    pub fn new() -> Self {
        Self {
            pool: ArrayQueue::new(WRITE_POOL_RETAIN),
        }
    }

    pub fn get(&self) -> Vec<u8> {
        self.pool.pop().unwrap_or_default()
    }

    /// 清空后归还, 一次超大的传输不会让池子永久膨胀
    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_WRITE_BUFFER {
            return;
        }
        buf.clear();
        let _ = self.pool.push(buf);
    }
}

impl Default for WriteBufferPool {
    fn default() -> Self {
        Self::new()
    }
}
