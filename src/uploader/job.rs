// 上传任务定义
//
// 任务身份不可变（序号由管理器在入队时分配），生命周期状态整体替换

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::oneshot;

use crate::uploader::transport::{TransportBody, TransportRequest};

/// 上传任务状态码
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 排队中
    Queued,
    /// 上传中
    Uploading,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已中止
    Aborted,
}

impl UploadStatus {
    /// 是否为终态（终态后不再发生任何状态转换）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Aborted
        )
    }
}

/// 上传任务生命周期状态
///
/// 值对象：每次状态转换整体替换，不做字段级修改
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadState {
    /// 状态码
    pub status: UploadStatus,
    /// 进度百分比 (0.0 - 100.0)
    pub percent: f64,
    /// 展示用消息
    pub message: String,
}

impl UploadState {
    fn new(status: UploadStatus, percent: f64, message: impl Into<String>) -> Self {
        Self {
            status,
            percent: percent.clamp(0.0, 100.0),
            message: message.into(),
        }
    }

    /// 排队状态
    pub fn queued() -> Self {
        Self::new(UploadStatus::Queued, 0.0, "Queued")
    }

    /// 上传中状态
    pub fn uploading(percent: f64, message: impl Into<String>) -> Self {
        Self::new(UploadStatus::Uploading, percent, message)
    }

    /// 完成状态（进度固定 100%）
    pub fn completed(message: impl Into<String>) -> Self {
        Self::new(UploadStatus::Completed, 100.0, message)
    }

    /// 失败状态（保留失败时刻的进度）
    pub fn failed(percent: f64, message: impl Into<String>) -> Self {
        Self::new(UploadStatus::Failed, percent, message)
    }

    /// 中止状态
    pub fn aborted(percent: f64, message: impl Into<String>) -> Self {
        Self::new(UploadStatus::Aborted, percent, message)
    }
}

/// 上传数据来源
///
/// 文件路径与内存缓冲互斥，由类型系统保证二选一
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// 本地文件
    File(PathBuf),
    /// 内存字节缓冲
    Data(Vec<u8>),
}

/// 任务关联的远端上下文（容器 + 目录路径）
///
/// 管理器不解释其含义，仅原样保留供调用方过滤
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadContext {
    /// 容器标识
    pub container: String,
    /// 目录路径
    pub folder_path: String,
}

/// 上传任务
#[derive(Debug)]
pub struct Upload {
    /// 任务序号（由管理器在入队时分配，单调递增）
    pub id: Option<u64>,
    /// 展示名称
    pub name: String,
    /// 内容类型
    pub content_type: String,
    /// 字节大小
    pub size: u64,
    /// 目标 URL
    pub url: String,
    /// HTTP 方法
    pub method: String,
    /// 请求头（有序）
    pub headers: Vec<(String, String)>,
    /// 数据来源
    pub source: UploadSource,
    /// 成功后是否自动从集合移除
    pub remove_on_success: bool,
    /// 失败/中止后是否自动从集合移除
    pub remove_on_failure: bool,
    /// 是否经由立即通道提交
    pub is_immediate: bool,
    /// 远端上下文
    pub context: Option<UploadContext>,
    /// 当前生命周期状态
    pub state: UploadState,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 终态结果发送端，恰好发送一次
    pub(crate) result_tx: Option<oneshot::Sender<UploadResult>>,
}

impl Upload {
    fn new(
        name: String,
        content_type: String,
        size: u64,
        url: String,
        source: UploadSource,
    ) -> Self {
        Self {
            id: None,
            name,
            content_type,
            size,
            url,
            method: "PUT".to_string(),
            headers: Vec::new(),
            source,
            remove_on_success: false,
            remove_on_failure: false,
            is_immediate: false,
            context: None,
            state: UploadState::queued(),
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            result_tx: None,
        }
    }

    /// 从本地文件创建上传任务
    pub fn from_file(
        name: impl Into<String>,
        content_type: impl Into<String>,
        size: u64,
        url: impl Into<String>,
        path: PathBuf,
    ) -> Self {
        Self::new(
            name.into(),
            content_type.into(),
            size,
            url.into(),
            UploadSource::File(path),
        )
    }

    /// 从内存缓冲创建上传任务
    pub fn from_data(
        name: impl Into<String>,
        content_type: impl Into<String>,
        size: u64,
        url: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self::new(
            name.into(),
            content_type.into(),
            size,
            url.into(),
            UploadSource::Data(data),
        )
    }

    /// 覆盖 HTTP 方法（默认 PUT）
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// 追加一个请求头
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// 设置远端上下文
    pub fn with_context(mut self, container: impl Into<String>, folder_path: impl Into<String>) -> Self {
        self.context = Some(UploadContext {
            container: container.into(),
            folder_path: folder_path.into(),
        });
        self
    }

    /// 设置终态自动清理标记
    pub fn with_auto_remove(mut self, on_success: bool, on_failure: bool) -> Self {
        self.remove_on_success = on_success;
        self.remove_on_failure = on_failure;
        self
    }

    /// 整体替换生命周期状态，并记录首次开始/完成时间
    pub fn set_state(&mut self, state: UploadState) {
        if state.status == UploadStatus::Uploading && self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
        if state.status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(chrono::Utc::now().timestamp());
        }
        self.state = state;
    }

    /// 生成只读快照（事件与结果通道载荷）
    pub fn snapshot(&self) -> UploadSnapshot {
        UploadSnapshot {
            id: self.id,
            name: self.name.clone(),
            content_type: self.content_type.clone(),
            size: self.size,
            url: self.url.clone(),
            method: self.method.clone(),
            is_immediate: self.is_immediate,
            context: self.context.clone(),
            state: self.state.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    /// 构造传输请求（负载按需克隆）
    pub(crate) fn transport_request(&self) -> TransportRequest {
        TransportRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            content_type: self.content_type.clone(),
            headers: self.headers.clone(),
            size: self.size,
            body: match &self.source {
                UploadSource::File(path) => TransportBody::File(path.clone()),
                UploadSource::Data(data) => TransportBody::Data(data.clone()),
            },
        }
    }

    /// 发送终态结果
    ///
    /// 发送端在此被取走，重复调用为无操作，保证恰好一次投递
    pub(crate) fn send_result(&mut self, success: bool) {
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.send(UploadResult {
                job: self.snapshot(),
                success,
            });
        }
    }
}

/// 上传任务只读快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSnapshot {
    /// 任务序号
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// 展示名称
    pub name: String,
    /// 内容类型
    pub content_type: String,
    /// 字节大小
    pub size: u64,
    /// 目标 URL
    pub url: String,
    /// HTTP 方法
    pub method: String,
    /// 是否经由立即通道提交
    #[serde(default)]
    pub is_immediate: bool,
    /// 远端上下文
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<UploadContext>,
    /// 生命周期状态
    pub state: UploadState,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

/// 终态结果（每个任务恰好投递一次）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    /// 任务快照
    pub job: UploadSnapshot,
    /// 是否成功（COMPLETED 为 true，FAILED/ABORTED 为 false）
    pub success: bool,
}
