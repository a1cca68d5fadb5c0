use bitflags::bitflags;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct StreamFlag: u8 {
        /// 已发出Open或已收到对端的Open
        const OPENED = 0x1;
        /// 本地写端已关闭
        const LOCAL_CLOSED = 0x2;
        /// 对端写端已关闭
        const REMOTE_CLOSED = 0x4;
        /// 对端已丢弃该流, 不会再读取也不会再归还窗口
        const RESET = 0x8;
    }
}

impl StreamFlag {
    pub fn is_local_closed(&self) -> bool {
        self.contains(StreamFlag::LOCAL_CLOSED)
    }

    pub fn is_remote_closed(&self) -> bool {
        self.contains(StreamFlag::REMOTE_CLOSED)
    }

    pub fn is_reset(&self) -> bool {
        self.contains(StreamFlag::RESET)
    }

    pub fn is_closed(&self) -> bool {
        self.contains(StreamFlag::LOCAL_CLOSED | StreamFlag::REMOTE_CLOSED)
    }

    pub fn state(&self) -> StreamState {
        if !self.contains(StreamFlag::OPENED) {
            return StreamState::Idle;
        }
        match (self.is_local_closed(), self.is_remote_closed()) {
            (false, false) => StreamState::Open,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (true, true) => StreamState::Closed,
        }
    }
}

/// 流的状态
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// 会话的状态
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Established,
    Closing,
    Closed,
}
