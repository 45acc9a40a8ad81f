// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 调度准入的并发上限
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    /// 进度事件节流间隔（毫秒，0 表示不节流）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

fn default_max_active() -> usize {
    4
}

fn default_progress_interval_ms() -> u64 {
    200
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_active: default_max_active(),
            progress_interval_ms: default_progress_interval_ms(),
            log: LogConfig::default(),
        }
    }
}

impl QueueConfig {
    /// 从 TOML 文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))?;
        Ok(config)
    }

    /// 保存配置到 TOML 文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
        }
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}
