//! 缓冲池, 避免每次读写都向系统申请内存
//! `BufferPool`按2的幂分级缓存定长字节块, `WriteBufferPool`缓存可增长的编码缓冲

mod buffer;
mod write_buffer;

pub use buffer::{BufferPool, DEFAULT_POOL_CLASSES};
pub use write_buffer::{WriteBufferPool, MAX_WRITE_BUFFER};
