use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};

use experiment_scheduler::{AppMode, Application, ShutdownManager};
use scheduler_config::{AppConfig, LogLevel, OutputFormat};
use scheduler_infrastructure::{init_logging, init_metrics};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("实验任务调度引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时按默认位置查找"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["scheduler", "recover"])
                .default_value("scheduler"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty", "compact"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mode: AppMode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("scheduler")
        .parse()?;

    let mut config = AppConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("<默认位置>")))?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log.level = level.parse::<LogLevel>().map_err(anyhow::Error::msg)?;
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log.format =
            format.parse::<OutputFormat>().map_err(anyhow::Error::msg)?;
    }

    init_logging(&config.observability.log)?;
    if config.observability.metrics_enabled {
        init_metrics(config.observability.metrics_port)?;
    }

    info!("启动实验任务调度引擎，模式: {:?}", mode);

    let app = Application::new(config).await?;
    let report = app.recover().await?;
    if mode == AppMode::Recover {
        info!(
            "恢复模式结束: 重新排队 {} 个任务，任务总数 {} -> {}",
            report.requeued_tasks.len(),
            report.total_tasks_before,
            report.total_tasks_after
        );
        return Ok(());
    }

    let shutdown_manager = ShutdownManager::new();
    let app = Arc::new(app);
    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("调度引擎运行失败: {e:#}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown();

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("调度引擎已关闭"),
        Ok(Err(e)) => error!("调度引擎关闭时发生错误: {e}"),
        Err(_) => warn!("关闭超时，强制退出"),
    }

    app.database().close().await;
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("监听Ctrl+C信号失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
