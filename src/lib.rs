// Upload Queue Rust Library
// 上传队列管理核心库

// 配置管理模块
pub mod config;

// 事件模块
pub mod events;

// 日志模块
pub mod logging;

// 上传队列模块
pub mod uploader;

// 导出常用类型
pub use config::{LogConfig, QueueConfig};
pub use events::{EventPriority, ProgressThrottler, UploadEvent};
pub use uploader::{
    HttpTransport, Transport, TransportBody, TransportError, TransportProgress, TransportRequest,
    TransportResponse, Upload, UploadContext, UploadHandle, UploadManager, UploadResult,
    UploadSnapshot, UploadSource, UploadState, UploadStatus,
};
