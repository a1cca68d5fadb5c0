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
// Created Date: 2023/10/16 09:35:12

use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{rustls, TlsConnector};

use crate::{HealthCheck, ProxyResult};

/// 可作为多路复用底层连接的流
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxStream = Box<dyn ProxyStream>;

/// 建立到某个地址的底层连接
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> ProxyResult<BoxStream>;
}

/// 普通的tcp连接, 连接结果会记录到健康检查中
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    connect_timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> ProxyResult<BoxStream> {
        let stream = HealthCheck::connect_timeout(&addr, self.connect_timeout).await?;
        Ok(Box::new(stream))
    }
}

/// 在tcp连接之上进行tls握手
pub struct TlsDialer {
    tcp: TcpDialer,
    connector: TlsConnector,
    /// 证书所校验的域名, 为空则取地址中的主机名
    domain: Option<String>,
}

impl TlsDialer {
    pub fn new(
        tcp: TcpDialer,
        config: Arc<rustls::ClientConfig>,
        domain: Option<String>,
    ) -> Self {
        Self {
            tcp,
            connector: TlsConnector::from(config),
            domain,
        }
    }

    fn server_name(&self, addr: &str) -> String {
        if let Some(domain) = &self.domain {
            return domain.clone();
        }
        match addr.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']').to_string(),
            None => addr.to_string(),
        }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, addr: &str) -> ProxyResult<BoxStream> {
        let stream = HealthCheck::connect_timeout(&addr, self.tcp.connect_timeout).await?;
        // 这里的域名只为认证设置
        let domain = rustls::pki_types::ServerName::try_from(self.server_name(addr))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname"))?;
        let outbound = self.connector.connect(domain, stream).await?;
        log::trace!("与{addr}完成tls握手");
        Ok(Box::new(outbound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name() {
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let dialer = TlsDialer::new(TcpDialer::default(), Arc::new(config.clone()), None);
        assert_eq!(dialer.server_name("example.com:443"), "example.com");
        assert_eq!(dialer.server_name("[::1]:443"), "::1");
        let dialer = TlsDialer::new(
            TcpDialer::default(),
            Arc::new(config),
            Some("soft.wm-proxy.com".to_string()),
        );
        assert_eq!(dialer.server_name("127.0.0.1:8091"), "soft.wm-proxy.com");
    }
}
