use std::{env, process, sync::Arc};

use flexi_logger::{colored_opt_format, Logger};
use gecko_avl::{config, config::Config, error::Error, server::Server, store::MemoryStore};
use log::error;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("gateway exit error: {:#}", e);
        eprintln!("gateway exit error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    // 获取配置，坏配置直接退出
    let cfg = Config::from_env()?;

    // 日志
    let level = if cfg.debug_log { "debug" } else { "info" };
    Logger::try_with_str(level)
        .unwrap()
        .format(colored_opt_format)
        .start()
        .unwrap();

    // demo 只带内存 store，其它 scheme 属于部署错误
    if cfg.store_uri != "memory://" {
        return Err(config::Error::Invalid {
            key: "STORE_URI",
            value: cfg.store_uri,
        }
        .into());
    }
    let store = Arc::new(MemoryStore::new());

    // 命令行参数里的 IMEI 预置为已知设备，未预置的设备会被拒绝
    for imei in env::args().skip(1) {
        store.provision_device(&imei).await;
    }

    // 启动网关
    Server::new(cfg).start(store).await?;
    Ok(())
}
