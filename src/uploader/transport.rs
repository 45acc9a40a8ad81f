// 传输适配层
//
// 每个任务对应一次传输；调度器只依赖这里的窄接口，
// 测试时可用假传输替代真实 HTTP 客户端

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, Method, Url};
use std::path::PathBuf;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// 内存负载的分块大小（64KB，逐块发送以产生进度信号）
const DATA_CHUNK_SIZE: usize = 64 * 1024;

/// 文件负载的读取缓冲大小
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// 传输请求负载
#[derive(Debug, Clone)]
pub enum TransportBody {
    /// 本地文件
    File(PathBuf),
    /// 内存字节缓冲
    Data(Vec<u8>),
}

/// 一次传输请求
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP 方法
    pub method: String,
    /// 目标 URL
    pub url: String,
    /// 内容类型
    pub content_type: String,
    /// 请求头（有序）
    pub headers: Vec<(String, String)>,
    /// 负载总字节数
    pub size: u64,
    /// 负载
    pub body: TransportBody,
}

/// 传输进度信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportProgress {
    /// 已传输字节数
    pub transferred: u64,
    /// 总字节数
    pub total: u64,
}

/// 传输完成信号
///
/// 协议层失败（状态码 >= 400）也会走到这里，由调度器归类
#[derive(Debug, Clone, Copy)]
pub struct TransportResponse {
    /// HTTP 状态码
    pub status: u16,
}

/// 传输层错误（与协议层失败相区分）
#[derive(Debug, Error)]
pub enum TransportError {
    /// 请求参数无法构造
    #[error("无效的传输请求: {0}")]
    BadRequest(String),
    /// 网络层失败（未取得响应）
    #[error("网络传输失败: {0}")]
    Network(#[from] reqwest::Error),
    /// 读取本地负载失败
    #[error("读取上传负载失败: {0}")]
    Io(#[from] std::io::Error),
}

/// 传输抽象
///
/// 一次 `execute` 调用对应一个任务的完整传输。中止由调用方丢弃
/// 本 future 实现，实现方无需感知取消
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: TransportRequest,
        progress: mpsc::UnboundedSender<TransportProgress>,
    ) -> Result<TransportResponse, TransportError>;
}

/// 将内存缓冲切成块流
fn data_stream(data: Vec<u8>) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
    let chunks: Vec<Vec<u8>> = data
        .chunks(DATA_CHUNK_SIZE)
        .map(|chunk| chunk.to_vec())
        .collect();
    futures::stream::iter(chunks.into_iter().map(Ok))
}

/// 为块流附加字节计数，每个块产生一次进度信号
fn counting_stream<S>(
    stream: S,
    total: u64,
    progress: mpsc::UnboundedSender<TransportProgress>,
) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static
where
    S: Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static,
{
    let mut transferred: u64 = 0;
    stream.map(move |item| {
        if let Ok(chunk) = &item {
            transferred += chunk.len() as u64;
            // 订阅端关闭时忽略发送失败
            let _ = progress.send(TransportProgress { transferred, total });
        }
        item
    })
}

/// 基于 reqwest 的 HTTP 传输
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// 创建默认客户端的传输
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// 复用外部构造的客户端
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: TransportRequest,
        progress: mpsc::UnboundedSender<TransportProgress>,
    ) -> Result<TransportResponse, TransportError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TransportError::BadRequest(format!("无效的 HTTP 方法: {}", request.method)))?;
        let url = Url::parse(&request.url)
            .map_err(|e| TransportError::BadRequest(format!("无效的 URL {}: {}", request.url, e)))?;

        let total = request.size;
        let raw: Pin<Box<dyn Stream<Item = Result<Vec<u8>, std::io::Error>> + Send>> =
            match request.body {
                TransportBody::Data(data) => Box::pin(data_stream(data)),
                TransportBody::File(path) => {
                    let file = tokio::fs::File::open(&path).await?;
                    Box::pin(
                        ReaderStream::with_capacity(file, FILE_CHUNK_SIZE)
                            .map(|res| res.map(|bytes| bytes.to_vec())),
                    )
                }
            };

        let mut builder = self
            .client
            .request(method, url)
            .header(CONTENT_TYPE, &request.content_type)
            .header(CONTENT_LENGTH, total);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .body(Body::wrap_stream(counting_stream(raw, total, progress)))
            .send()
            .await?;

        let status = response.status().as_u16();
        debug!("传输完成: url={}, status={}", request.url, status);

        Ok(TransportResponse { status })
    }
}
