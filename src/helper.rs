use std::{io, net::ToSocketAddrs};

use lazy_static::lazy_static;
use log::LevelFilter;
use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
};
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use webparse::{BinaryMut, Buf};

use crate::{pool::BufferPool, prot::ProtFrame, ConfigOption, ProxyError, ProxyResult};

lazy_static! {
    static ref LOG4RS_HANDLE: Mutex<Option<log4rs::Handle>> = Mutex::new(None);
}

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} {l} {m}{n}";

pub struct Helper;

impl Helper {
    /// 从读缓冲中解出一个完整的帧, 数据不足时不消耗任何字节
    pub fn decode_frame(
        read: &mut BinaryMut,
        max_frame_size: usize,
        pool: &BufferPool,
    ) -> ProxyResult<Option<ProtFrame>> {
        match ProtFrame::decode(read.chunk(), max_frame_size, pool)? {
            Some((frame, used)) => {
                read.advance(used);
                if !read.has_remaining() {
                    read.clear();
                }
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    #[cfg(not(target_os = "windows"))]
    fn set_reuse_port(socket: &Socket, reuse: bool) -> io::Result<()> {
        socket.set_reuse_port(reuse)?;
        Ok(())
    }

    #[cfg(target_os = "windows")]
    fn set_reuse_port(_socket: &Socket, _reuse: bool) -> io::Result<()> {
        Ok(())
    }

    /// 可端口复用的绑定方式，该端口可能被多个进程同时使用
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<TcpListener> {
        let addrs = addr.to_socket_addrs()?;
        let mut last_err = None;
        for addr in addrs {
            let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
            socket.set_nonblocking(true)?;
            if addr.is_ipv6() {
                let _ = socket.set_only_v6(false);
            }
            socket.set_reuse_address(true)?;
            Self::set_reuse_port(&socket, true)?;
            if let Err(e) = socket.bind(&addr.into()) {
                log::info!("绑定端口地址失败，地址：{:?}", addr);
                last_err = Some(e);
                continue;
            }
            match socket.listen(1024) {
                Ok(_) => {
                    let listener: std::net::TcpListener = socket.into();
                    return TcpListener::from_std(listener);
                }
                Err(e) => {
                    log::info!("监听端口地址失败，地址：{:?}", addr);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "could not resolve to any address",
            )
        }))
    }

    /// 初始化日志, 重复调用时替换原有的配置
    pub fn try_init_log(option: &ConfigOption) -> ProxyResult<()> {
        let mut log_config = log4rs::config::Config::builder();
        let mut root = Root::builder();

        if let Some(log_file) = &option.log_file {
            let appender = FileAppender::builder()
                .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
                .build(&log_file.path)?;
            log_config = log_config.appender(
                Appender::builder()
                    .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
                        log_file.level,
                    )))
                    .build("file", Box::new(appender)),
            );
            root = root.appender("file");
        }

        if !option.disable_stdout {
            let stdout: ConsoleAppender = ConsoleAppender::builder()
                .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
                .build();
            log_config = log_config.appender(Appender::builder().build("stdout", Box::new(stdout)));
            root = root.appender("stdout");
        }

        let level = option.default_level.unwrap_or(LevelFilter::Info);
        let log_config = log_config
            .build(root.build(level))
            .map_err(|_| ProxyError::Extension("日志配置错误"))?;

        let mut handle = LOG4RS_HANDLE.lock();
        match &*handle {
            Some(h) => h.set_config(log_config),
            None => {
                let h = log4rs::init_config(log_config)
                    .map_err(|_| ProxyError::Extension("日志已被其它组件初始化"))?;
                *handle = Some(h);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use webparse::BufMut;

    use super::*;

    #[test]
    fn test_decode_frame_stream() {
        let pool = BufferPool::default();
        let mut wire = vec![];
        ProtFrame::new_data(1, 3, b"hello".to_vec())
            .encode(&mut wire)
            .unwrap();
        ProtFrame::new_close(1, 3).encode(&mut wire).unwrap();

        let mut read = BinaryMut::new();
        read.put_slice(&wire[..5]);
        assert!(Helper::decode_frame(&mut read, 1024, &pool).unwrap().is_none());
        read.put_slice(&wire[5..]);
        let frame = Helper::decode_frame(&mut read, 1024, &pool).unwrap().unwrap();
        assert_eq!(frame.data(), b"hello");
        let frame = Helper::decode_frame(&mut read, 1024, &pool).unwrap().unwrap();
        assert_eq!(frame.sid(), 3);
        assert!(Helper::decode_frame(&mut read, 1024, &pool).unwrap().is_none());
        assert!(!read.has_remaining());
    }

    #[tokio::test]
    async fn test_bind() {
        let listener = Helper::bind("127.0.0.1:0").await.unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }
}
