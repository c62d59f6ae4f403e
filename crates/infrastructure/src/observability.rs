use anyhow::Result;
use metrics::{counter, gauge, histogram};
use scheduler_config::{LogConfig, OutputFormat};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化结构化日志。`RUST_LOG` 优先于配置中的级别。
pub fn init_logging(log_config: &LogConfig) -> Result<()> {
    let mut env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_config.level.to_string()));
    for directive in &log_config.filter_directives {
        env_filter = env_filter.add_directive(directive.parse()?);
    }

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_config.format {
        OutputFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_file(log_config.include_location)
                .with_line_number(log_config.include_location)
                .with_thread_ids(log_config.include_thread_ids);
            registry.with(fmt_layer).try_init()?;
        }
        OutputFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_file(log_config.include_location)
                .with_line_number(log_config.include_location)
                .with_thread_ids(log_config.include_thread_ids);
            registry.with(fmt_layer).try_init()?;
        }
        OutputFormat::Compact => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_file(log_config.include_location)
                .with_line_number(log_config.include_location)
                .with_thread_ids(log_config.include_thread_ids);
            registry.with(fmt_layer).try_init()?;
        }
    }

    info!(
        logging.format = ?log_config.format,
        logging.level = %log_config.level,
        "日志系统初始化完成"
    );
    Ok(())
}

/// 安装 Prometheus 指标导出器
pub fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    info!("Prometheus 指标导出器已启动，端口 {}", port);
    Ok(())
}

/// 编排引擎指标。未安装导出器时这些调用是空操作。
pub struct EngineMetrics;

impl EngineMetrics {
    pub fn task_enqueued() {
        counter!("scheduler_tasks_enqueued_total").increment(1);
    }

    pub fn task_assigned() {
        counter!("scheduler_tasks_assigned_total").increment(1);
    }

    pub fn task_finished(status: &'static str) {
        counter!("scheduler_tasks_finished_total", "status" => status).increment(1);
    }

    pub fn task_failure(class: &'static str) {
        counter!("scheduler_task_failures_total", "class" => class).increment(1);
    }

    pub fn task_requeued(charged: bool) {
        let charged = if charged { "true" } else { "false" };
        counter!("scheduler_tasks_requeued_total", "charged" => charged).increment(1);
    }

    pub fn staging_finished(status: &'static str, duration_seconds: f64) {
        counter!("scheduler_staging_operations_total", "status" => status).increment(1);
        histogram!("scheduler_staging_duration_seconds").record(duration_seconds);
    }

    pub fn worker_reaped() {
        counter!("scheduler_workers_reaped_total").increment(1);
    }

    pub fn connected_workers(count: usize) {
        gauge!("scheduler_connected_workers").set(count as f64);
    }

    pub fn recovery_run(crashed: bool, duration_seconds: f64) {
        let crashed = if crashed { "true" } else { "false" };
        counter!("scheduler_recovery_runs_total", "crashed" => crashed).increment(1);
        histogram!("scheduler_recovery_duration_seconds").record(duration_seconds);
    }
}
