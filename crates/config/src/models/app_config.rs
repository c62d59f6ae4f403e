use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    database::DatabaseConfig,
    engine::{
        DispatcherConfig, RecoveryConfig, SchedulerStateConfig, StagingConfig, WorkerAgentConfig,
        WorkerPoolConfig,
    },
    logging::ObservabilityConfig,
    resources::{validate_topology, LocalWorkerConfig, ResourceConfig},
};
use crate::validation::ConfigValidator;
use crate::{ConfigError, ConfigResult};

const DEFAULT_PATHS: [&str; 3] = [
    "config/scheduler.toml",
    "scheduler.toml",
    "/etc/scheduler/config.toml",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub dispatcher: DispatcherConfig,
    pub worker_pool: WorkerPoolConfig,
    pub staging: StagingConfig,
    pub recovery: RecoveryConfig,
    pub scheduler_state: SchedulerStateConfig,
    pub worker_agent: WorkerAgentConfig,
    pub observability: ObservabilityConfig,
    pub resources: Vec<ResourceConfig>,
    pub local_workers: Vec<LocalWorkerConfig>,
}

impl AppConfig {
    /// 加载顺序：内置默认值 -> TOML文件 -> `SCHEDULER__` 前缀的环境变量
    pub fn load(config_path: Option<&str>) -> ConfigResult<Self> {
        let mut builder =
            ConfigBuilder::builder().add_source(ConfigBuilder::try_from(&AppConfig::default())?);

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(ConfigError::File(format!("配置文件不存在: {path}")));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if let Some(path) = DEFAULT_PATHS.iter().find(|p| Path::new(p).exists()) {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEDULER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> ConfigResult<Self> {
        let config: AppConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.database.validate()?;
        self.dispatcher.validate()?;
        self.worker_pool.validate()?;
        self.staging.validate()?;
        self.recovery.validate()?;
        self.scheduler_state.validate()?;
        self.worker_agent.validate()?;
        self.observability.validate()?;
        validate_topology(&self.resources, &self.local_workers)?;

        // Worker自我停机时间不得早于调度器的心跳超时
        if self.worker_agent.server_unresponsive_timeout_seconds
            < self.worker_pool.heartbeat_timeout_seconds
        {
            return Err(ConfigError::Validation(
                "worker_agent.server_unresponsive_timeout_seconds must be >= worker_pool.heartbeat_timeout_seconds"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
