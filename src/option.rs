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
// Created Date: 2023/09/25 10:42:02

use std::{
    fs::File,
    io::{self, BufReader},
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use bpaf::*;
use log::LevelFilter;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use tokio_rustls::{rustls, TlsAcceptor};

use crate::{ConfigDuration, ConfigLog, MuxConfig, ProxyError, ProxyResult, WrapAddr};

pub struct Builder {
    inner: ProxyResult<ProxyConfig>,
}

impl Builder {
    #[inline]
    pub fn new() -> Builder {
        Builder {
            inner: Ok(ProxyConfig::default()),
        }
    }

    pub fn bind(self, addr: SocketAddr) -> Builder {
        self.and_then(|mut proxy| {
            proxy.bind = WrapAddr(addr);
            Ok(proxy)
        })
    }

    pub fn server(self, addr: Option<String>) -> Builder {
        self.and_then(|mut proxy| {
            proxy.server = addr;
            Ok(proxy)
        })
    }

    pub fn forward(self, addr: String) -> Builder {
        self.and_then(|mut proxy| {
            proxy.forward.push(addr);
            Ok(proxy)
        })
    }

    pub fn ts(self, is_tls: bool) -> Builder {
        self.and_then(|mut proxy| {
            proxy.ts = is_tls;
            Ok(proxy)
        })
    }

    pub fn tc(self, is_tls: bool) -> Builder {
        self.and_then(|mut proxy| {
            proxy.tc = is_tls;
            Ok(proxy)
        })
    }

    pub fn cert(self, cert: Option<String>) -> Builder {
        self.and_then(|mut proxy| {
            proxy.cert = cert;
            Ok(proxy)
        })
    }

    pub fn key(self, key: Option<String>) -> Builder {
        self.and_then(|mut proxy| {
            proxy.key = key;
            Ok(proxy)
        })
    }

    pub fn domain(self, domain: Option<String>) -> Builder {
        self.and_then(|mut proxy| {
            proxy.domain = domain;
            Ok(proxy)
        })
    }

    pub fn connect_timeout(self, timeout: Duration) -> Builder {
        self.and_then(|mut proxy| {
            proxy.connect_timeout = ConfigDuration::new(timeout);
            Ok(proxy)
        })
    }

    fn and_then<F>(self, func: F) -> Self
    where
        F: FnOnce(ProxyConfig) -> ProxyResult<ProxyConfig>,
    {
        Builder {
            inner: self.inner.and_then(func),
        }
    }

    pub fn into_value(self) -> ProxyResult<ProxyConfig> {
        self.inner.and_then(|proxy| {
            proxy.verify()?;
            Ok(proxy)
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_bind_addr() -> WrapAddr {
    WrapAddr(SocketAddr::from(([127, 0, 0, 1], 8090)))
}

fn default_connect_timeout() -> ConfigDuration {
    ConfigDuration::from_secs(5)
}

/// 代理配置
/// 配置了server则本端为客户端, 把收到的连接通过多路复用转发给服务端;
/// 否则本端为服务端, 把收到的每个流转发给forward中的上游
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Bpaf)]
pub struct ProxyConfig {
    /// 代理绑定端口地址
    #[bpaf(short('b'), long, fallback(default_bind_addr()), display_fallback)]
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_bind_addr")]
    pub(crate) bind: WrapAddr,

    /// 连接多路复用服务端地址
    #[bpaf(short('S'), long("server"))]
    pub(crate) server: Option<String>,

    /// 服务端转发的上游地址, 可配置多个
    #[bpaf(short('f'), long("forward"))]
    #[serde(default)]
    pub(crate) forward: Vec<String>,

    /// 连接服务端是否启用tls
    #[serde(default)]
    pub(crate) ts: bool,
    /// 接收客户端是否启用tls
    #[serde(default)]
    pub(crate) tc: bool,
    /// tls证书所用的域名
    pub(crate) domain: Option<String>,
    /// 公开的证书公钥文件
    pub(crate) cert: Option<String>,
    /// 隐私的证书私钥文件
    pub(crate) key: Option<String>,

    /// 连接超时时间
    #[bpaf(fallback(default_connect_timeout()), display_fallback)]
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_connect_timeout")]
    pub(crate) connect_timeout: ConfigDuration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_addr(),
            server: None,
            forward: vec![],
            ts: false,
            tc: false,
            domain: None,
            cert: None,
            key: None,
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind.0
    }

    pub fn server(&self) -> Option<&String> {
        self.server.as_ref()
    }

    /// 未配置上级服务端的即为多路复用服务端
    pub fn is_server(&self) -> bool {
        self.server.is_none()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        if self.connect_timeout.is_zero() {
            None
        } else {
            Some(self.connect_timeout.0)
        }
    }

    /// 解析所有的上游地址
    pub fn forward_addrs(&self) -> ProxyResult<Vec<SocketAddr>> {
        let mut addrs = vec![];
        for forward in &self.forward {
            let resolved: Vec<SocketAddr> = forward.to_socket_addrs()?.collect();
            if resolved.is_empty() {
                return Err(ProxyError::Extension("无法解析上游地址"));
            }
            addrs.extend(resolved);
        }
        Ok(addrs)
    }

    pub fn verify(&self) -> ProxyResult<()> {
        if self.is_server() && self.forward.is_empty() {
            return Err(ProxyError::Extension("服务端必须配置forward上游地址"));
        }
        if self.tc && (self.cert.is_none() || self.key.is_none()) {
            return Err(ProxyError::Extension("启用tc必须配置cert及key"));
        }
        Ok(())
    }

    fn load_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()
    }

    fn load_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "No private key found")
        })
    }

    /// 获取服务端tls的证书信息
    pub fn get_tls_accept(&self) -> ProxyResult<TlsAcceptor> {
        let (cert, key) = match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => (cert, key),
            _ => return Err(ProxyError::Extension("启用tc必须配置cert及key")),
        };
        let certs = Self::load_certs(cert)?;
        let key = Self::load_key(key)?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// 获取客户端tls的Config配置, cert可额外指定信任的证书
    pub fn get_tls_request(&self) -> ProxyResult<Arc<rustls::ClientConfig>> {
        let mut root_cert_store = rustls::RootCertStore::empty();
        // 信任通用的签名商
        root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(cert) = &self.cert {
            for cert in Self::load_certs(cert)? {
                let _ = root_cert_store.add(cert);
            }
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

/// 完整的配置文件
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOption {
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// 多路复用的参数, 客户端与服务端需保持一致
    #[serde(default)]
    pub mux: MuxConfig,
    #[serde(default)]
    pub disable_stdout: bool,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub default_level: Option<LevelFilter>,
    /// 日志文件, 如"logs/wmsmux.log info"
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub log_file: Option<ConfigLog>,
}

impl ConfigOption {
    pub fn new_by_proxy(proxy: ProxyConfig) -> Self {
        ConfigOption {
            proxy: Some(proxy),
            ..Default::default()
        }
    }

    pub fn after_load_option(&mut self) -> ProxyResult<()> {
        self.mux.verify()?;
        if let Some(proxy) = &self.proxy {
            proxy.verify()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let proxy = ProxyConfig::builder()
            .bind("127.0.0.1:9001".parse().unwrap())
            .server(Some("127.0.0.1:9002".to_string()))
            .ts(true)
            .into_value()
            .unwrap();
        assert!(!proxy.is_server());
        assert_eq!(proxy.bind_addr().port(), 9001);
        assert_eq!(proxy.connect_timeout(), Some(Duration::from_secs(5)));

        assert!(ProxyConfig::builder().into_value().is_err());
        assert!(ProxyConfig::builder()
            .forward("127.0.0.1:80".to_string())
            .tc(true)
            .into_value()
            .is_err());
    }

    #[test]
    fn test_yaml() {
        let mut option: ConfigOption = serde_yaml::from_str(
            r#"
default_level: debug
log_file: "logs/wmsmux.log warn"
proxy:
  bind: "0.0.0.0:8091"
  forward:
    - "127.0.0.1:8080"
    - "127.0.0.1:8081"
  connect_timeout: 3s
mux:
  keep_alive_interval: 5s
  keep_alive_timeout: 20s
  max_stream_buffer: 1m
"#,
        )
        .unwrap();
        option.after_load_option().unwrap();
        let proxy = option.proxy.clone().unwrap();
        assert!(proxy.is_server());
        assert_eq!(proxy.forward_addrs().unwrap().len(), 2);
        assert_eq!(proxy.connect_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(option.default_level, Some(LevelFilter::Debug));
        assert_eq!(option.log_file.unwrap().level, LevelFilter::Warn);
        assert_eq!(option.mux.max_stream_buffer(), 1024 * 1024);
    }
}
