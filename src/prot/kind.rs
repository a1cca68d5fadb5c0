use super::TrafficClass;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProtCmd {
    /// 新建流
    Open = 0,
    /// 数据
    Data = 1,
    /// 关闭本地写端
    Close = 2,
    /// 心跳
    KeepAlive = 3,
    /// 归还流控窗口
    WindowUpdate = 4,
}

impl ProtCmd {
    pub fn new(byte: u8) -> Option<ProtCmd> {
        match byte {
            0 => Some(ProtCmd::Open),
            1 => Some(ProtCmd::Data),
            2 => Some(ProtCmd::Close),
            3 => Some(ProtCmd::KeepAlive),
            4 => Some(ProtCmd::WindowUpdate),
            _ => None,
        }
    }

    pub fn encode(&self) -> u8 {
        *self as u8
    }

    /// 心跳及窗口更新优先发送, 其余按提交顺序与数据同级,
    /// 保证同一个流的Open/Data/Close在线上的顺序不变
    pub fn class(&self) -> TrafficClass {
        match self {
            ProtCmd::KeepAlive | ProtCmd::WindowUpdate => TrafficClass::Control,
            ProtCmd::Open | ProtCmd::Data | ProtCmd::Close => TrafficClass::Data,
        }
    }
}
