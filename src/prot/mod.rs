mod frame;
mod kind;

pub use frame::{ProtFrame, ProtFrameHeader, FRAME_HEADER_BYTES, MAX_FRAME_LENGTH};
pub use kind::ProtCmd;

/// 发送时的流量类型, 控制类永远先于数据类发送
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrafficClass {
    Control = 0,
    Data = 1,
}
