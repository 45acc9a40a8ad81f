//! 队列事件类型定义
//!
//! 所有生命周期事件汇入同一个带标签的事件通道，订阅方按需过滤

use serde::{Deserialize, Serialize};

use crate::uploader::UploadSnapshot;

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度更新
    Low = 0,
    /// 中优先级：状态变更
    Medium = 1,
    /// 高优先级：终态、移除等关键事件
    High = 2,
}

/// 上传队列事件
///
/// 每个事件携带受影响任务的快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 任务入队（FIFO 通道）
    Queued { job: UploadSnapshot },
    /// 任务强制插入（立即通道）
    Forced { job: UploadSnapshot },
    /// 任务开始上传
    Started { job: UploadSnapshot },
    /// 进度更新
    Progress {
        job: UploadSnapshot,
        transferred: u64,
        total: u64,
        progress: f64,
    },
    /// 任务完成
    Completed { job: UploadSnapshot },
    /// 任务失败
    Failed { job: UploadSnapshot, error: String },
    /// 任务中止
    Aborted { job: UploadSnapshot },
    /// 任务从集合移除
    Removed { job: UploadSnapshot },
}

impl UploadEvent {
    /// 获取受影响任务的快照
    pub fn job(&self) -> &UploadSnapshot {
        match self {
            UploadEvent::Queued { job } => job,
            UploadEvent::Forced { job } => job,
            UploadEvent::Started { job } => job,
            UploadEvent::Progress { job, .. } => job,
            UploadEvent::Completed { job } => job,
            UploadEvent::Failed { job, .. } => job,
            UploadEvent::Aborted { job } => job,
            UploadEvent::Removed { job } => job,
        }
    }

    /// 获取任务序号
    pub fn job_id(&self) -> Option<u64> {
        self.job().id
    }

    /// 获取事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            UploadEvent::Progress { .. } => EventPriority::Low,
            UploadEvent::Queued { .. } => EventPriority::Medium,
            UploadEvent::Forced { .. } => EventPriority::Medium,
            UploadEvent::Started { .. } => EventPriority::Medium,
            UploadEvent::Completed { .. } => EventPriority::High,
            UploadEvent::Failed { .. } => EventPriority::High,
            UploadEvent::Aborted { .. } => EventPriority::High,
            UploadEvent::Removed { .. } => EventPriority::High,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Queued { .. } => "queued",
            UploadEvent::Forced { .. } => "forced",
            UploadEvent::Started { .. } => "started",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::Completed { .. } => "completed",
            UploadEvent::Failed { .. } => "failed",
            UploadEvent::Aborted { .. } => "aborted",
            UploadEvent::Removed { .. } => "removed",
        }
    }
}
