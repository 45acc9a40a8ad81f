// 上传队列模块
//
// - job: 任务与生命周期状态定义
// - manager: 队列管理器（准入、调度、移除、结算）
// - transport: 传输抽象与 HTTP 实现

pub mod job;
pub mod manager;
pub mod transport;

pub use job::{
    Upload, UploadContext, UploadResult, UploadSnapshot, UploadSource, UploadState, UploadStatus,
};
pub use manager::{UploadHandle, UploadManager};
pub use transport::{
    HttpTransport, Transport, TransportBody, TransportError, TransportProgress, TransportRequest,
    TransportResponse,
};
