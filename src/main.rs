use wmsmux::{Proxy, ProxyResult};

async fn run_main() -> ProxyResult<()> {
    let mut proxy = Proxy::parse_env()?;
    proxy.start_serve().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run_main().await {
        log::error!("运行失败: {}", e);
        eprintln!("运行失败: {}", e);
        std::process::exit(1);
    }
}
