use std::time::Duration;

use scheduler_config::StagingConfig;

/// 指数退避策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 首次重试间隔
    pub initial_interval: Duration,
    /// 最大重试间隔
    pub max_interval: Duration,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1, // 10%的随机抖动
        }
    }
}

impl RetryPolicy {
    pub fn from_staging_config(config: &StagingConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(config.initial_backoff_ms),
            max_interval: Duration::from_millis(config.max_backoff_ms),
            backoff_multiplier: config.backoff_multiplier,
            ..Self::default()
        }
    }

    /// 第 `attempt` 次重试前的等待时间（从0开始计）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_interval.as_secs_f64();
        let max = self.max_interval.as_secs_f64().max(base);

        let exponential = base * self.backoff_multiplier.powi(attempt.min(64) as i32);
        let capped = exponential.min(max);

        // 加随机抖动，避免同时失败的传输同时重试
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_secs = (capped + jitter).clamp(base, max);

        Duration::from_secs_f64(final_secs)
    }
}
