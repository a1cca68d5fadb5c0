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
// Created Date: 2023/09/22 10:28:28

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
    sync::mpsc::{channel, Receiver},
};
use tokio_rustls::TlsAcceptor;

use crate::{
    arg,
    dialer::{Dialer, TcpDialer, TlsDialer},
    CenterClient, CenterServer, ConfigOption, Helper, ProxyConfig, ProxyError, ProxyResult,
};

/// 代理的两种角色
enum Role {
    /// 把收到的连接经多路复用转发到服务端
    Client {
        server: String,
        center: Arc<CenterClient>,
    },
    /// 接收客户端的多路复用连接
    Server {
        center: Arc<CenterServer>,
        accept: Option<TlsAcceptor>,
    },
}

pub struct Proxy {
    option: ConfigOption,
    role: Option<Role>,
}

impl Proxy {
    pub fn new(option: ConfigOption) -> Proxy {
        Self { option, role: None }
    }

    /// 解析命令行并初始化日志
    pub fn parse_env() -> ProxyResult<Proxy> {
        let option = arg::parse_env()?;
        Helper::try_init_log(&option)?;
        Ok(Proxy::new(option))
    }

    fn proxy_config(&self) -> ProxyResult<&ProxyConfig> {
        self.option
            .proxy
            .as_ref()
            .ok_or(ProxyError::Extension("未配置proxy"))
    }

    fn build_role(&self) -> ProxyResult<Role> {
        let proxy = self.proxy_config()?;
        let mux = self.option.mux.clone();
        if let Some(server) = proxy.server() {
            let tcp = TcpDialer::new(proxy.connect_timeout());
            let dialer: Arc<dyn Dialer> = if proxy.ts {
                Arc::new(TlsDialer::new(
                    tcp,
                    proxy.get_tls_request()?,
                    proxy.domain.clone(),
                ))
            } else {
                Arc::new(tcp)
            };
            Ok(Role::Client {
                server: server.clone(),
                center: Arc::new(CenterClient::new(dialer, mux)),
            })
        } else {
            let forward = proxy.forward_addrs()?;
            let accept = if proxy.tc {
                Some(proxy.get_tls_accept()?)
            } else {
                None
            };
            let center =
                CenterServer::new(mux, forward).with_connect_timeout(proxy.connect_timeout());
            Ok(Role::Server {
                center: Arc::new(center),
                accept,
            })
        }
    }

    /// 绑定监听地址, 并按配置准备好客户端或服务端
    pub async fn bind(&mut self) -> ProxyResult<TcpListener> {
        let role = self.build_role()?;
        let addr = self.proxy_config()?.bind_addr();
        let listener = Helper::bind(addr).await?;
        match &role {
            Role::Client { server, .. } => {
                log::info!("绑定代理：{:?}，转发到多路复用服务端{}。", addr, server)
            }
            Role::Server { accept, .. } => log::info!(
                "绑定代理：{:?}，提供多路复用服务端功能{}。",
                addr,
                if accept.is_some() { "(tls)" } else { "" }
            ),
        }
        self.role = Some(role);
        Ok(listener)
    }

    fn deal_stream(&self, inbound: TcpStream, addr: SocketAddr) -> ProxyResult<()> {
        let role = self
            .role
            .as_ref()
            .ok_or(ProxyError::Extension("代理未绑定"))?;
        match role {
            Role::Client { server, center } => {
                let server = server.clone();
                let center = center.clone();
                tokio::spawn(async move {
                    let mut inbound = inbound;
                    let mut stream = match center.dial(&server).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            log::warn!("无法与服务端{}建立流, 原因: {}", server, e);
                            return;
                        }
                    };
                    match copy_bidirectional(&mut inbound, &mut stream).await {
                        Ok((up, down)) => log::trace!(
                            "{}经流sid={}转发完成, 上行{}字节, 下行{}字节",
                            addr,
                            stream.id(),
                            up,
                            down
                        ),
                        Err(e) => log::debug!("{}经流sid={}转发失败: {}", addr, stream.id(), e),
                    }
                });
            }
            Role::Server { center, accept } => match accept {
                Some(accept) => {
                    let accept = accept.clone();
                    let center = center.clone();
                    tokio::spawn(async move {
                        // 获取的流跟正常内容一样读写, 在内部实现了自动加解密
                        match accept.accept(inbound).await {
                            Ok(inbound) => {
                                if let Err(e) = center.serve(inbound) {
                                    log::warn!("创建会话失败: {}", e);
                                }
                            }
                            Err(e) => {
                                log::warn!("接收来自{}的tls连接失败, 原因为: {:?}", addr, e);
                            }
                        }
                    });
                }
                None => {
                    center.serve(inbound)?;
                }
            },
        }
        Ok(())
    }

    /// 接收连接直到收到关闭信号
    pub async fn run_serve(
        &mut self,
        listener: TcpListener,
        mut close_receiver: Receiver<()>,
    ) -> ProxyResult<()> {
        loop {
            tokio::select! {
                _ = close_receiver.recv() => {
                    log::info!("收到关闭信号, 停止服务");
                    break;
                }
                r = listener.accept() => {
                    match r {
                        Ok((inbound, addr)) => {
                            log::trace!("代理收到客户端连接: {}->{}", addr, listener.local_addr()?);
                            let _ = inbound.set_nodelay(true);
                            if let Err(e) = self.deal_stream(inbound, addr) {
                                log::warn!("处理来自{}的连接失败: {}", addr, e);
                            }
                        }
                        Err(e) => {
                            log::warn!("接收连接失败: {}", e);
                        }
                    }
                }
            }
        }

        match self.role.take() {
            Some(Role::Client { center, .. }) => center.close_all().await,
            Some(Role::Server { center, .. }) => center.close_all(),
            None => {}
        }
        Ok(())
    }

    pub async fn start_serve(&mut self) -> ProxyResult<()> {
        log::trace!("开始启动服务器，正在加载配置中");
        let listener = self.bind().await?;
        let (_sender, receiver) = channel::<()>(1);
        self.run_serve(listener, receiver).await
    }
}
