#![deny(rust_2018_idioms)]

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;
    use tokio::{
        io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
        time::timeout,
    };
    use wmsmux::{
        ConfigDuration, ConfigSize, MuxConfig, ProxyError, Session, SessionState, StreamState,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn mux_config() -> MuxConfig {
        let mut config = MuxConfig::default();
        config.keep_alive_disabled = true;
        config
    }

    fn pair(client: MuxConfig, server: MuxConfig) -> (Session, Session) {
        let (a, b) = duplex(256 * 1024);
        (
            Session::wrap_client(a, client).unwrap(),
            Session::wrap_server(b, server).unwrap(),
        )
    }

    fn pattern(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
    }

    #[tokio::test]
    async fn stream_order_and_half_close() {
        init_log();
        let (client, server) = pair(mux_config(), mux_config());

        // 数据量超过接收窗口, 需要多次窗口更新才能发完
        let payload = pattern(7, 1024 * 1024 + 123);
        let mut stream = client.open_stream().unwrap();
        let send = payload.clone();
        let writer = tokio::spawn(async move {
            stream.write_all(&send).await.unwrap();
            stream.shutdown().await.unwrap();
            assert_eq!(stream.state(), StreamState::HalfClosedLocal);
            stream
        });

        let mut peer = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
        let mut received = vec![];
        timeout(WAIT, peer.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), payload.len());
        assert!(received == payload);

        // 本端关闭写后依然可以收到对端的数据
        let mut stream = timeout(WAIT, writer).await.unwrap().unwrap();
        peer.write_all(b"reply after half close").await.unwrap();
        peer.shutdown().await.unwrap();
        let mut reply = vec![];
        timeout(WAIT, stream.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"reply after half close");
        assert_eq!(stream.state(), StreamState::Closed);

        // 两端均关闭后继续读取返回结束
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(stream.write_all(b"late").await.is_err());

        drop(stream);
        drop(peer);
        assert_eq!(client.num_streams(), 0);
        assert_eq!(server.num_streams(), 0);
    }

    #[tokio::test]
    async fn concurrent_stream_isolation() {
        init_log();
        let (client, server) = pair(mux_config(), mux_config());

        let echo = server.clone();
        tokio::spawn(async move {
            while let Ok(mut stream) = echo.accept_stream().await {
                tokio::spawn(async move {
                    let mut data = vec![];
                    stream.read_to_end(&mut data).await.unwrap();
                    stream.write_all(&data).await.unwrap();
                    stream.shutdown().await.unwrap();
                });
            }
        });

        let mut handles = vec![];
        for i in 0..16u8 {
            let mut stream = client.open_stream().unwrap();
            handles.push(tokio::spawn(async move {
                let payload = pattern(i, 64 * 1024 + i as usize * 977);
                let (mut reader, mut writer) = tokio::io::split(&mut stream);
                let send = payload.clone();
                let write = async move {
                    writer.write_all(&send).await.unwrap();
                    writer.shutdown().await.unwrap();
                };
                let mut echoed = vec![];
                let read = reader.read_to_end(&mut echoed);
                let (_, r) = tokio::join!(write, read);
                r.unwrap();
                assert!(echoed == payload, "stream {} corrupted", i);
            }));
        }
        for r in timeout(WAIT, join_all(handles)).await.unwrap() {
            r.unwrap();
        }
    }

    #[tokio::test]
    async fn teardown_wakes_blocked_callers() {
        init_log();
        let mut config = mux_config();
        config.max_frame_size = ConfigSize(1024);
        config.max_stream_buffer = ConfigSize(4096);
        let (client, server) = pair(config.clone(), config);

        // 对端接收但不读取, 写满窗口后阻塞
        let mut blocked_writer = client.open_stream().unwrap();
        let mut blocked_reader = client.open_stream().unwrap();
        let _held_a = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
        let _held_b = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();

        let write = tokio::spawn(async move {
            blocked_writer.write_all(&vec![1u8; 64 * 1024]).await
        });
        let read = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            blocked_reader.read(&mut buf).await
        });
        let accept_client = client.clone();
        let accept = tokio::spawn(async move { accept_client.accept_stream().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!write.is_finished());
        assert!(!read.is_finished());
        assert!(!accept.is_finished());

        server.close();

        assert!(timeout(WAIT, write).await.unwrap().unwrap().is_err());
        assert!(timeout(WAIT, read).await.unwrap().unwrap().is_err());
        assert!(timeout(WAIT, accept).await.unwrap().unwrap().is_err());
        assert!(client.is_closed());
        assert!(matches!(client.error(), Some(ProxyError::IoError(_))));
        assert!(matches!(client.open_stream(), Err(ProxyError::SessionClosed)));

        timeout(WAIT, async {
            while client.state() != SessionState::Closed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn keepalive_timeout_is_fatal() {
        init_log();
        let mut config = MuxConfig::default();
        config.keep_alive_interval = ConfigDuration::from_millis(50);
        config.keep_alive_timeout = ConfigDuration::from_millis(200);
        // 对端不回应任何数据
        let (a, _silent): (DuplexStream, DuplexStream) = duplex(64 * 1024);
        let client = Session::wrap_client(a, config).unwrap();
        let mut stream = client.open_stream().unwrap();

        timeout(WAIT, client.closed()).await.unwrap();
        assert!(client.error().map(|e| e.is_timeout()).unwrap_or(false));
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn keepalive_keeps_idle_session() {
        init_log();
        let mut config = MuxConfig::default();
        config.keep_alive_interval = ConfigDuration::from_millis(50);
        config.keep_alive_timeout = ConfigDuration::from_millis(200);
        let (client, server) = pair(config.clone(), config);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!client.is_closed());
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn full_backlog_refuses_open() {
        init_log();
        let mut server_config = mux_config();
        server_config.accept_backlog = 1;
        let (client, _server) = pair(mux_config(), server_config);

        let mut first = client.open_stream().unwrap();
        let mut second = client.open_stream().unwrap();

        // 被拒绝的流收到Close, 读取返回结束而不是一直等待
        let mut buf = [0u8; 4];
        let n = timeout(WAIT, second.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
        assert!(timeout(Duration::from_millis(100), first.read(&mut buf))
            .await
            .is_err());
    }

    fn small_window() -> MuxConfig {
        let mut config = mux_config();
        config.max_frame_size = ConfigSize(1024);
        config.max_stream_buffer = ConfigSize(4096);
        config
    }

    #[tokio::test]
    async fn write_after_peer_drop_does_not_hang() {
        init_log();
        let (client, server) = pair(small_window(), small_window());

        let mut stream = client.open_stream().unwrap();
        let peer = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
        drop(peer);

        // 写入量远超窗口, 对端丢弃后必须以错误结束而不是一直等待
        let r = timeout(WAIT, stream.write_all(&vec![3u8; 64 * 1024]))
            .await
            .unwrap();
        assert_eq!(r.unwrap_err().kind(), std::io::ErrorKind::BrokenPipe);
        assert!(stream.error().is_some());
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn refused_stream_write_fails() {
        init_log();
        let mut server_config = small_window();
        server_config.accept_backlog = 1;
        let (client, _server) = pair(small_window(), server_config);

        let _first = client.open_stream().unwrap();
        let mut second = client.open_stream().unwrap();
        let r = timeout(WAIT, second.write_all(&vec![5u8; 64 * 1024]))
            .await
            .unwrap();
        assert!(r.is_err());
    }

    #[tokio::test]
    async fn half_closed_peer_keeps_receiving() {
        init_log();
        let (client, server) = pair(small_window(), small_window());

        let payload = pattern(11, 64 * 1024);
        let mut stream = client.open_stream().unwrap();
        let send = payload.clone();
        let writer = tokio::spawn(async move {
            stream.write_all(&send).await.unwrap();
            stream.shutdown().await.unwrap();
            stream
        });

        // 对端先关闭写端, 之后依然读取并归还窗口
        let mut peer = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
        peer.shutdown().await.unwrap();
        let mut received = vec![];
        timeout(WAIT, peer.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received == payload);

        let mut stream = timeout(WAIT, writer).await.unwrap().unwrap();
        assert!(stream.error().is_none());
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn keepalive_with_double_interval_timeout() {
        init_log();
        let mut config = MuxConfig::default();
        config.keep_alive_interval = ConfigDuration::from_millis(100);
        config.keep_alive_timeout = ConfigDuration::from_millis(200);
        let (client, server) = pair(config.clone(), config);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!client.is_closed());
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn malformed_frame_is_fatal() {
        init_log();
        let (mut raw, b) = duplex(1024);
        let server = Session::wrap_server(b, mux_config()).unwrap();
        // 未知的命令字
        raw.write_all(&[1, 9, 0, 0, 0, 1, 0, 0]).await.unwrap();
        timeout(WAIT, server.closed()).await.unwrap();
        assert!(matches!(server.error(), Some(ProxyError::UnknownCmd(9))));

        let (mut raw, b) = duplex(1024);
        let server = Session::wrap_server(b, mux_config()).unwrap();
        // 版本号不一致
        raw.write_all(&[2, 3, 0, 0, 0, 0, 0, 0]).await.unwrap();
        timeout(WAIT, server.closed()).await.unwrap();
        assert!(server.error().map(|e| e.is_protocol()).unwrap_or(false));
    }

    #[tokio::test]
    async fn unknown_stream_is_ignored() {
        init_log();
        let (mut raw, b) = duplex(1024);
        let server = Session::wrap_server(b, mux_config()).unwrap();
        // 数据, 关闭及窗口更新指向不存在的流
        raw.write_all(&[1, 1, 0, 0, 0, 9, 0, 2, b'h', b'i']).await.unwrap();
        raw.write_all(&[1, 2, 0, 0, 0, 9, 0, 0]).await.unwrap();
        raw.write_all(&[1, 4, 0, 0, 0, 9, 0, 4, 0, 0, 1, 0]).await.unwrap();
        // 随后正常打开一个流
        raw.write_all(&[1, 0, 0, 0, 0, 11, 0, 0]).await.unwrap();
        let stream = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
        assert_eq!(stream.id(), 11);
        assert!(!server.is_closed());
    }
}
