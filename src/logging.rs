//! 日志模块 - 文件日志初始化
//!
//! 轮转交给 tracing-appender 的滚动写入器（按天切文件）；
//! 这里只负责把配置翻译成订阅器层。

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_subscriber::prelude::*;

/// 日志文件名前缀（实际文件带日期后缀）
const LOG_FILE_PREFIX: &str = "sync.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 轮转粒度: "daily", "hourly", "never"
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_enabled() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            level: default_level(),
            rotation: default_rotation(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    fn appender(&self, log_dir: &Path) -> tracing_appender::rolling::RollingFileAppender {
        match self.rotation.to_lowercase().as_str() {
            "hourly" => tracing_appender::rolling::hourly(log_dir, LOG_FILE_PREFIX),
            "never" => tracing_appender::rolling::never(log_dir, LOG_FILE_PREFIX),
            _ => tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX),
        }
    }
}

/// 初始化文件日志（嵌入方可选调用）
pub fn init_file_logging(log_dir: &Path, config: &LogConfig) {
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level().into())
        .add_directive("sqlx=warn".parse().unwrap())
        .add_directive("hyper=warn".parse().unwrap());

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(config.appender(log_dir))
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    let _ = tracing::subscriber::set_global_default(subscriber);
}
