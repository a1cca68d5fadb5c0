mod arg;
mod center_client;
mod center_server;
mod check;
mod config;
mod dialer;
mod error;
mod helper;
mod option;
pub mod pool;
pub mod prot;
mod proxy;
pub mod streams;

pub use arg::{parse_env, read_config_from_path, WrapAddr};
pub use center_client::CenterClient;
pub use center_server::{CenterServer, StreamHandler};
pub use check::HealthCheck;
pub use config::{ConfigDuration, ConfigLog, ConfigSize, MuxConfig};
pub use dialer::{BoxStream, Dialer, ProxyStream, TcpDialer, TlsDialer};
pub use error::{ProxyError, ProxyResult};
pub use helper::Helper;
pub use option::{Builder, ConfigOption, ProxyConfig};
pub use proxy::Proxy;
pub use streams::{MuxStream, Session, SessionState, StreamState};
