// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh
// -----
// Created Date: 2024/01/16 10:59:37

use std::{
    fmt::Display,
    fs::File,
    io::{self, Read},
    net::{AddrParseError, SocketAddr},
    path::Path,
    process::exit,
    str::FromStr,
};

use bpaf::*;
use log::LevelFilter;

use crate::{option::proxy_config, ConfigOption, ProxyConfig, ProxyResult};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 地址参数, 允许":8090"这种省略主机的写法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapAddr(pub SocketAddr);

impl FromStr for WrapAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(':') {
            let addr = format!("127.0.0.1{s}").parse::<SocketAddr>()?;
            Ok(WrapAddr(addr))
        } else {
            let addr = s.parse::<SocketAddr>()?;
            Ok(WrapAddr(addr))
        }
    }
}

impl Display for WrapAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

#[derive(Debug, Clone, Bpaf)]
struct Shared {
    /// 禁用默认输出
    pub(crate) disable_stdout: bool,
    /// 是否显示更多日志
    #[bpaf(short, long)]
    pub(crate) verbose: bool,
    /// 设置默认等级
    pub(crate) default_level: Option<LevelFilter>,
}

#[derive(Debug, Clone, Bpaf)]
struct RunConfig {
    /// 配置文件路径
    #[bpaf(short, long)]
    pub(crate) config: String,
}

#[derive(Debug, Clone, Bpaf)]
struct CheckConfig {
    /// 配置文件路径
    #[bpaf(short, long)]
    pub(crate) config: String,
}

#[derive(Debug, Clone, Bpaf)]
struct VersionConfig {}

#[derive(Debug, Clone)]
enum Command {
    Proxy(ProxyConfig),
    Run(RunConfig),
    Check(CheckConfig),
    Version(VersionConfig),
}

fn parse_command() -> impl Parser<(Command, Shared)> {
    let action = proxy_config().map(Command::Proxy);
    let action = construct!(action, shared())
        .to_options()
        .command("proxy")
        .help("多路复用代理, 配置server则为客户端, 否则为服务端");

    let run = run_config().map(Command::Run);
    let run = construct!(run, shared())
        .to_options()
        .command("run")
        .help("启动命令");

    let check = check_config().map(Command::Check);
    let check = construct!(check, shared())
        .to_options()
        .command("check")
        .help("检查配置是否正确");

    let version_config = version_config().map(Command::Version);
    let version_config = construct!(version_config, shared())
        .to_options()
        .command("version")
        .help("打印当前版本号");
    construct!([action, run, check, version_config])
}

/// 按扩展名解析配置文件, 支持yaml/yml/toml/json
pub fn read_config_from_path<P: AsRef<Path>>(path: P) -> ProxyResult<ConfigOption> {
    let path = path.as_ref();
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let mut option = match &*extension {
        "yaml" | "yml" => serde_yaml::from_str::<ConfigOption>(&contents).map_err(|e| {
            log::error!("解析文件错误: {}", e);
            io::Error::new(io::ErrorKind::Other, format!("parse yaml error: {e}"))
        })?,
        "toml" => toml::from_str::<ConfigOption>(&contents).map_err(|e| {
            log::error!("解析文件错误: {}", e);
            io::Error::new(io::ErrorKind::Other, format!("parse toml error: {e}"))
        })?,
        "json" => serde_json::from_str::<ConfigOption>(&contents).map_err(|e| {
            log::error!("解析文件错误: {}", e);
            io::Error::new(io::ErrorKind::Other, format!("parse json error: {e}"))
        })?,
        _ => {
            let e = io::Error::new(io::ErrorKind::Other, "unknow format error");
            return Err(e.into());
        }
    };
    option.after_load_option()?;
    Ok(option)
}

pub fn parse_env() -> ProxyResult<ConfigOption> {
    let (command, shared) = parse_command().run();
    let mut option = match command {
        Command::Proxy(proxy) => {
            let mut option = ConfigOption::new_by_proxy(proxy);
            option.after_load_option()?;
            option
        }
        Command::Run(config) => read_config_from_path(&config.config)?,
        Command::Check(config) => match read_config_from_path(&config.config) {
            Ok(_) => {
                println!("配置文件正确");
                exit(0);
            }
            Err(e) => {
                println!("配置文件错误:{}", e);
                exit(1);
            }
        },
        Command::Version(_) => {
            println!("当前版本号:{}", VERSION);
            exit(0);
        }
    };
    if shared.disable_stdout {
        option.disable_stdout = true;
    }
    if shared.default_level.is_some() {
        option.default_level = shared.default_level;
    }
    if shared.verbose {
        option.default_level = Some(LevelFilter::Trace);
    }
    Ok(option)
}
