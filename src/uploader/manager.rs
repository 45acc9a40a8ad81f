// 上传队列管理器
//
// 负责管理上传任务的完整生命周期：
// - 有序任务集合与单调序号分配
// - FIFO 准入与立即（优先）准入
// - 并发上限控制（调度循环每次至多准入一个任务）
// - 暂停/恢复/移除
// - 传输回调的统一结算（完成/失败/中止/进度）

use anyhow::{bail, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::events::{ProgressThrottler, UploadEvent};
use crate::uploader::job::{Upload, UploadResult, UploadSnapshot, UploadState, UploadStatus};
use crate::uploader::transport::{Transport, TransportProgress};

/// 事件广播通道容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

type SharedUpload = Arc<RwLock<Upload>>;

/// 入队回执
///
/// 携带管理器分配的任务序号与终态结果接收端（恰好收到一次投递）
#[derive(Debug)]
pub struct UploadHandle {
    /// 任务序号
    pub id: u64,
    /// 终态结果接收端
    pub result: oneshot::Receiver<UploadResult>,
}

/// 终态结算方式
enum Settle {
    Completed,
    Failed(String),
    Aborted,
}

/// 上传队列管理器
///
/// 所有字段均为 Arc 包装，克隆句柄即共享同一队列
#[derive(Clone)]
pub struct UploadManager {
    /// 有序任务集合（从准入到显式移除）
    jobs: Arc<RwLock<Vec<SharedUpload>>>,
    /// 活跃传输计数（含立即通道启动的传输）
    active_count: Arc<AtomicUsize>,
    /// 调度准入的并发上限（动态可调整）
    max_active: Arc<AtomicUsize>,
    /// 调度开关（false 时只暂停新准入，不影响进行中的传输）
    enabled: Arc<AtomicBool>,
    /// 任务序号源（单调递增，管理器生命周期内唯一）
    next_id: Arc<AtomicU64>,
    /// 活跃传输句柄（任务序号 -> 取消令牌）
    /// 任务处于上传中状态时必有对应条目
    handles: Arc<DashMap<u64, CancellationToken>>,
    /// 事件广播发送端
    event_tx: broadcast::Sender<UploadEvent>,
    /// 传输实现
    transport: Arc<dyn Transport>,
    /// 进度事件节流间隔（毫秒，0 表示不节流）
    progress_interval_ms: u64,
}

impl UploadManager {
    /// 创建管理器（默认配置：并发上限 4）
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, &QueueConfig::default())
    }

    /// 创建管理器（从配置读取参数）
    pub fn with_config(transport: Arc<dyn Transport>, config: &QueueConfig) -> Self {
        info!(
            "创建上传队列管理器: 并发上限={}, 进度节流={}ms",
            config.max_active, config.progress_interval_ms
        );
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            jobs: Arc::new(RwLock::new(Vec::new())),
            active_count: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(config.max_active)),
            enabled: Arc::new(AtomicBool::new(true)),
            next_id: Arc::new(AtomicU64::new(1)),
            handles: Arc::new(DashMap::new()),
            event_tx,
            transport,
            progress_interval_ms: config.progress_interval_ms,
        }
    }

    /// 订阅队列事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    /// FIFO 入队
    ///
    /// 分配序号、置为排队状态并追加到集合末尾，随后触发调度循环。
    /// 经由此通道提交的任务相互之间保证 FIFO 准入顺序
    pub async fn queue(&self, mut job: Upload) -> Result<UploadHandle> {
        if let Some(id) = job.id {
            bail!("任务已被提交过 (id={})", id);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        job.id = Some(id);
        job.set_state(UploadState::queued());
        let (result_tx, result_rx) = oneshot::channel();
        job.result_tx = Some(result_tx);

        info!("任务入队: id={}, name={}, size={}", id, job.name, job.size);

        let snapshot = job.snapshot();
        let shared = Arc::new(RwLock::new(job));
        self.jobs.write().await.push(shared);
        self.publish(UploadEvent::Queued { job: snapshot });

        self.pump().await;
        Ok(UploadHandle { id, result: result_rx })
    }

    /// 立即上传（优先通道）
    ///
    /// 不等待空闲并发槽位：直接置为上传中并无条件启动传输。
    /// 任务插入到第一个仍在排队的 FIFO 任务之前；共享计数照常递增，
    /// 从而约束调度循环可再准入的 FIFO 任务数量
    pub async fn immediate(&self, mut job: Upload) -> Result<UploadHandle> {
        if let Some(id) = job.id {
            bail!("任务已被提交过 (id={})", id);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        job.id = Some(id);
        job.is_immediate = true;
        job.set_state(UploadState::uploading(0.0, "Immediate Upload"));
        let (result_tx, result_rx) = oneshot::channel();
        job.result_tx = Some(result_tx);

        info!("任务立即上传: id={}, name={}, size={}", id, job.name, job.size);

        let snapshot = job.snapshot();
        let shared = Arc::new(RwLock::new(job));
        {
            let mut jobs = self.jobs.write().await;
            let mut position = jobs.len();
            for (index, existing) in jobs.iter().enumerate() {
                let guard = existing.read().await;
                if guard.state.status == UploadStatus::Queued && !guard.is_immediate {
                    position = index;
                    break;
                }
            }
            jobs.insert(position, shared.clone());
            self.active_count.fetch_add(1, Ordering::SeqCst);
        }
        self.publish(UploadEvent::Forced { job: snapshot });
        self.launch(shared).await;
        Ok(UploadHandle { id, result: result_rx })
    }

    /// 恢复调度并立即尝试准入
    pub async fn start(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        info!("上传调度已恢复");
        self.pump().await;
    }

    /// 暂停调度
    ///
    /// 只暂停新任务的准入，进行中的传输不受影响
    pub fn pause(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        info!("上传调度已暂停");
    }

    /// 调度是否开启
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// 移除任务
    ///
    /// 上传中的任务先中止传输并同步走中止结算（中止事件先于移除事件），
    /// 随后无条件从集合移除。任务不存在时为无操作，返回 false
    pub async fn remove(&self, id: u64) -> bool {
        let Some(shared) = self.find_job(id).await else {
            return false;
        };

        if let Some((_, token)) = self.handles.remove(&id) {
            token.cancel();
        }
        let uploading = shared.read().await.state.status == UploadStatus::Uploading;
        if uploading {
            self.settle(&shared, id, Settle::Aborted).await;
        }

        self.detach(id).await;
        info!("任务已移除: id={}", id);
        true
    }

    /// 移除所有已结束（完成/失败/中止）的任务
    pub async fn remove_finished(&self) -> usize {
        let ids: Vec<u64> = {
            let jobs = self.jobs.read().await;
            let mut ids = Vec::new();
            for job in jobs.iter() {
                let guard = job.read().await;
                if guard.state.status.is_terminal() {
                    if let Some(id) = guard.id {
                        ids.push(id);
                    }
                }
            }
            ids
        };

        let mut removed = 0;
        for id in ids {
            if self.detach(id).await {
                removed += 1;
            }
        }
        info!("已清理 {} 个已结束任务", removed);
        removed
    }

    /// 移除全部任务（上传中的任务会被中止）
    pub async fn remove_all(&self) -> usize {
        let ids: Vec<u64> = {
            let jobs = self.jobs.read().await;
            let mut ids = Vec::new();
            for job in jobs.iter() {
                if let Some(id) = job.read().await.id {
                    ids.push(id);
                }
            }
            ids
        };

        let mut removed = 0;
        for id in ids {
            if self.remove(id).await {
                removed += 1;
            }
        }
        removed
    }

    /// 获取所有任务快照（集合顺序）
    pub async fn get_all_jobs(&self) -> Vec<UploadSnapshot> {
        let jobs = self.jobs.read().await;
        let mut result = Vec::with_capacity(jobs.len());
        for job in jobs.iter() {
            result.push(job.read().await.snapshot());
        }
        result
    }

    /// 获取单个任务快照
    pub async fn get_job(&self, id: u64) -> Option<UploadSnapshot> {
        match self.find_job(id).await {
            Some(job) => Some(job.read().await.snapshot()),
            None => None,
        }
    }

    /// 当前活跃传输数
    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    /// 当前并发上限
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// 🔧 动态调整并发上限，上调后立即尝试准入
    pub async fn set_max_active(&self, new_max: usize) {
        let old_max = self.max_active.swap(new_max, Ordering::SeqCst);
        info!("动态调整并发上限: {} -> {}", old_max, new_max);
        self.pump().await;
    }

    // ==================== 内部实现 ====================

    /// 按序号查找任务
    async fn find_job(&self, id: u64) -> Option<SharedUpload> {
        let jobs = self.jobs.read().await;
        for job in jobs.iter() {
            if job.read().await.id == Some(id) {
                return Some(job.clone());
            }
        }
        None
    }

    /// 调度循环
    ///
    /// 每次调用至多准入一个排队任务；入队、恢复与每次终态结算后都会
    /// 被再次触发，由此保证调度准入的并发数不超过上限且按 FIFO 顺序。
    /// QUEUED -> UPLOADING 的状态替换在集合写锁内完成，并发触发的
    /// 调度循环不会重复准入同一任务
    async fn pump(&self) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }

        let claimed = {
            let jobs = self.jobs.write().await;
            if self.active_count.load(Ordering::SeqCst) >= self.max_active.load(Ordering::SeqCst) {
                None
            } else {
                let mut claimed = None;
                for job in jobs.iter() {
                    let mut guard = job.write().await;
                    if guard.state.status == UploadStatus::Queued {
                        let name = guard.name.clone();
                        guard.set_state(UploadState::uploading(0.0, format!("{} starting.", name)));
                        self.active_count.fetch_add(1, Ordering::SeqCst);
                        claimed = Some((job.clone(), guard.snapshot()));
                        break;
                    }
                }
                claimed
            }
        };

        if let Some((shared, snapshot)) = claimed {
            debug!(
                "调度准入: id={:?}, 活跃数={}/{}",
                snapshot.id,
                self.active_count.load(Ordering::SeqCst),
                self.max_active.load(Ordering::SeqCst)
            );
            self.publish(UploadEvent::Started { job: snapshot });
            self.launch(shared).await;
        }
    }

    /// 为任务启动传输驱动
    ///
    /// 立即通道与调度准入共用此入口；调用前任务状态已置为上传中、
    /// 计数已递增
    async fn launch(&self, shared: SharedUpload) {
        let id = shared.read().await.id.unwrap_or_default();
        let token = CancellationToken::new();
        self.handles.insert(id, token.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            manager.drive(shared, token).await;
        });
    }

    /// 传输驱动：发起传输并把进度/终态信号回灌到管理器状态
    async fn drive(&self, shared: SharedUpload, token: CancellationToken) {
        let (id, request) = {
            let guard = shared.read().await;
            if guard.state.status.is_terminal() {
                // 启动与移除竞争时任务可能已被结算
                if let Some(job_id) = guard.id {
                    self.handles.remove(&job_id);
                }
                return;
            }
            (guard.id.unwrap_or_default(), guard.transport_request())
        };

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let throttler = ProgressThrottler::with_millis(self.progress_interval_ms);
        let transport = self.transport.clone();
        let mut call = Box::pin(transport.execute(request, progress_tx));
        let mut progress_open = true;

        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => break Settle::Aborted,
                tick = progress_rx.recv(), if progress_open => {
                    match tick {
                        Some(progress) => self.on_progress(&shared, progress, &throttler).await,
                        None => progress_open = false,
                    }
                }
                result = &mut call => {
                    break match result {
                        Ok(response) if response.status >= 400 => {
                            Settle::Failed(format!("HTTP {}", response.status))
                        }
                        Ok(_) => Settle::Completed,
                        Err(e) => Settle::Failed(e.to_string()),
                    };
                }
            }
        };

        if !matches!(outcome, Settle::Aborted) {
            // 排空缓冲的进度信号，让最后的进度先落进状态
            while let Ok(progress) = progress_rx.try_recv() {
                self.on_progress(&shared, progress, &throttler).await;
            }
        }

        self.settle(&shared, id, outcome).await;
    }

    /// 进度回调：整体替换任务状态并按节流发布进度事件
    async fn on_progress(
        &self,
        shared: &SharedUpload,
        progress: TransportProgress,
        throttler: &ProgressThrottler,
    ) {
        let percent = if progress.total == 0 {
            0.0
        } else {
            (progress.transferred as f64 / progress.total as f64 * 100.0).clamp(0.0, 100.0)
        };

        let snapshot = {
            let mut guard = shared.write().await;
            // 迟到的进度信号不得覆盖终态
            if guard.state.status != UploadStatus::Uploading {
                return;
            }
            let name = guard.name.clone();
            guard.set_state(UploadState::uploading(
                percent,
                format!("{} [{}%]", name, percent.round() as u32),
            ));
            guard.snapshot()
        };

        if throttler.should_emit() {
            self.publish(UploadEvent::Progress {
                job: snapshot,
                transferred: progress.transferred,
                total: progress.total,
                progress: percent,
            });
        }
    }

    /// 终态结算（完成/失败/中止共用）
    ///
    /// 终态判定与状态替换在任务写锁内完成：并发的结算（例如移除与
    /// 自然完成同时到达）只有一方生效，计数恰好递减一次、结果恰好
    /// 投递一次。结算末尾重新触发调度循环
    async fn settle(&self, shared: &SharedUpload, id: u64, outcome: Settle) {
        let settled = {
            let mut guard = shared.write().await;
            if guard.state.status.is_terminal() {
                None
            } else {
                let name = guard.name.clone();
                let percent = guard.state.percent;
                let (success, error) = match &outcome {
                    Settle::Completed => {
                        guard.set_state(UploadState::completed(format!(
                            "{} completed successfully.",
                            name
                        )));
                        (true, None)
                    }
                    Settle::Failed(reason) => {
                        guard.set_state(UploadState::failed(
                            percent,
                            format!("{} failed: {}", name, reason),
                        ));
                        (false, Some(reason.clone()))
                    }
                    Settle::Aborted => {
                        guard
                            .set_state(UploadState::aborted(percent, format!("{} aborted.", name)));
                        (false, None)
                    }
                };
                let evict = if success {
                    guard.remove_on_success
                } else {
                    guard.remove_on_failure
                };
                let snapshot = guard.snapshot();
                guard.send_result(success);
                Some((snapshot, evict, error))
            }
        };

        let Some((snapshot, evict, error)) = settled else {
            return;
        };

        self.handles.remove(&id);

        let event = match outcome {
            Settle::Completed => {
                info!("任务完成: id={}, name={}", id, snapshot.name);
                UploadEvent::Completed { job: snapshot }
            }
            Settle::Failed(_) => {
                warn!(
                    "任务失败: id={}, name={}, error={:?}",
                    id, snapshot.name, error
                );
                UploadEvent::Failed {
                    job: snapshot,
                    error: error.unwrap_or_default(),
                }
            }
            Settle::Aborted => {
                info!("任务中止: id={}, name={}", id, snapshot.name);
                UploadEvent::Aborted { job: snapshot }
            }
        };
        self.publish(event);

        if evict {
            self.detach(id).await;
        }

        self.active_count.fetch_sub(1, Ordering::SeqCst);
        self.pump().await;
    }

    /// 从集合移除任务并发布移除事件；不存在时为无操作
    async fn detach(&self, id: u64) -> bool {
        let removed = {
            let mut jobs = self.jobs.write().await;
            let mut index = None;
            for (i, job) in jobs.iter().enumerate() {
                if job.read().await.id == Some(id) {
                    index = Some(i);
                    break;
                }
            }
            match index {
                Some(i) => {
                    let job = jobs.remove(i);
                    let snapshot = job.read().await.snapshot();
                    Some(snapshot)
                }
                None => None,
            }
        };

        match removed {
            Some(snapshot) => {
                self.publish(UploadEvent::Removed { job: snapshot });
                true
            }
            None => false,
        }
    }

    /// 发布事件（无订阅者时静默丢弃）
    fn publish(&self, event: UploadEvent) {
        debug!(
            "发布事件: type={}, job_id={:?}",
            event.event_type_name(),
            event.job_id()
        );
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::uploader::transport::{TransportError, TransportRequest, TransportResponse};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// 假传输的一次调用：测试端取走后人工投递进度与结果
    struct FakeCall {
        url: String,
        progress: mpsc::UnboundedSender<TransportProgress>,
        respond: oneshot::Sender<Result<TransportResponse, TransportError>>,
    }

    /// 可人工驱动的假传输
    struct FakeTransport {
        calls: Mutex<Vec<FakeCall>>,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        /// 等待指定 URL 的传输被发起并取走控制权
        async fn take_call(&self, url: &str) -> FakeCall {
            for _ in 0..400 {
                {
                    let mut calls = self.calls.lock().await;
                    if let Some(pos) = calls.iter().position(|c| c.url == url) {
                        return calls.remove(pos);
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("未观察到对 {} 的传输调用", url);
        }

        async fn finish(&self, url: &str, status: u16) {
            let call = self.take_call(url).await;
            let _ = call.respond.send(Ok(TransportResponse { status }));
        }

        async fn fail(&self, url: &str) {
            let call = self.take_call(url).await;
            let _ = call.respond.send(Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            ))));
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn execute(
            &self,
            request: TransportRequest,
            progress: mpsc::UnboundedSender<TransportProgress>,
        ) -> Result<TransportResponse, TransportError> {
            let (respond, rx) = oneshot::channel();
            self.calls.lock().await.push(FakeCall {
                url: request.url.clone(),
                progress,
                respond,
            });
            match rx.await {
                Ok(result) => result,
                // 控制端被丢弃时保持传输中
                Err(_) => std::future::pending().await,
            }
        }
    }

    fn test_config(max_active: usize) -> QueueConfig {
        QueueConfig {
            max_active,
            progress_interval_ms: 0,
            log: LogConfig::default(),
        }
    }

    fn data_job(name: &str) -> Upload {
        Upload::from_data(
            name,
            "application/octet-stream",
            8,
            format!("https://uploads.test/{}", name),
            vec![0u8; 8],
        )
    }

    fn url_of(name: &str) -> String {
        format!("https://uploads.test/{}", name)
    }

    async fn status_of(manager: &UploadManager, id: u64) -> UploadStatus {
        manager
            .get_job(id)
            .await
            .expect("任务应在集合中")
            .state
            .status
    }

    async fn wait_for_status(manager: &UploadManager, id: u64, status: UploadStatus) {
        for _ in 0..400 {
            if let Some(job) = manager.get_job(id).await {
                if job.state.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("任务 {} 未在超时前到达 {:?}", id, status);
    }

    async fn wait_for_absent(manager: &UploadManager, id: u64) {
        for _ in 0..400 {
            if manager.get_job(id).await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("任务 {} 未在超时前被移除", id);
    }

    #[tokio::test]
    async fn test_fifo_admission_with_ceiling() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(2));

        let a = manager.queue(data_job("a")).await.unwrap();
        let b = manager.queue(data_job("b")).await.unwrap();
        let c = manager.queue(data_job("c")).await.unwrap();
        let d = manager.queue(data_job("d")).await.unwrap();

        // 上限 2：前两个立即开始，其余排队
        assert_eq!(status_of(&manager, a.id).await, UploadStatus::Uploading);
        assert_eq!(status_of(&manager, b.id).await, UploadStatus::Uploading);
        assert_eq!(status_of(&manager, c.id).await, UploadStatus::Queued);
        assert_eq!(status_of(&manager, d.id).await, UploadStatus::Queued);
        assert_eq!(manager.active_count(), 2);

        // a 完成后 c 按 FIFO 顺序准入，b/d 不受影响
        fake.finish(&url_of("a"), 200).await;
        wait_for_status(&manager, c.id, UploadStatus::Uploading).await;
        assert_eq!(status_of(&manager, a.id).await, UploadStatus::Completed);
        assert_eq!(status_of(&manager, b.id).await, UploadStatus::Uploading);
        assert_eq!(status_of(&manager, d.id).await, UploadStatus::Queued);

        let result = a.result.await.unwrap();
        assert!(result.success);
        assert_eq!(result.job.state.status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn test_sequence_ids_monotonic() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(1));

        let a = manager.queue(data_job("a")).await.unwrap();
        let b = manager.queue(data_job("b")).await.unwrap();
        let c = manager.immediate(data_job("c")).await.unwrap();

        assert!(a.id < b.id);
        assert!(b.id < c.id);
    }

    #[tokio::test]
    async fn test_immediate_bypasses_ceiling() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(2));

        let _a = manager.queue(data_job("a")).await.unwrap();
        let _b = manager.queue(data_job("b")).await.unwrap();
        let c = manager.queue(data_job("c")).await.unwrap();
        assert_eq!(manager.active_count(), 2);

        // 立即通道无视上限，同步进入上传中
        let e = manager.immediate(data_job("e")).await.unwrap();
        assert_eq!(status_of(&manager, e.id).await, UploadStatus::Uploading);
        assert_eq!(manager.active_count(), 3);
        assert_eq!(
            manager.get_job(e.id).await.unwrap().state.message,
            "Immediate Upload"
        );

        // 插入位置：位于第一个排队任务之前
        let names: Vec<String> = manager
            .get_all_jobs()
            .await
            .iter()
            .map(|j| j.name.clone())
            .collect();
        assert_eq!(names, ["a", "b", "e", "c"]);

        // e 完成后计数回到上限，c 仍需等待空闲槽位
        fake.finish(&url_of("e"), 200).await;
        wait_for_status(&manager, e.id, UploadStatus::Completed).await;
        assert_eq!(manager.active_count(), 2);
        assert_eq!(status_of(&manager, c.id).await, UploadStatus::Queued);

        fake.finish(&url_of("a"), 200).await;
        wait_for_status(&manager, c.id, UploadStatus::Uploading).await;
    }

    #[tokio::test]
    async fn test_pause_suppresses_admission() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(1));

        manager.pause();
        let a = manager.queue(data_job("a")).await.unwrap();
        assert_eq!(status_of(&manager, a.id).await, UploadStatus::Queued);
        assert_eq!(manager.active_count(), 0);

        manager.start().await;
        assert_eq!(status_of(&manager, a.id).await, UploadStatus::Uploading);
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_queued_job() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(1));
        let mut events = manager.subscribe();

        let _a = manager.queue(data_job("a")).await.unwrap();
        let b = manager.queue(data_job("b")).await.unwrap();
        assert_eq!(status_of(&manager, b.id).await, UploadStatus::Queued);

        assert!(manager.remove(b.id).await);
        assert!(manager.get_job(b.id).await.is_none());

        // 排队任务被移除时从未进入上传中
        let removed = loop {
            match events.recv().await.unwrap() {
                UploadEvent::Removed { job } => break job,
                _ => continue,
            }
        };
        assert_eq!(removed.id, Some(b.id));
        assert_eq!(removed.state.status, UploadStatus::Queued);

        // 结果通道随任务一起丢弃
        assert!(b.result.await.is_err());

        // 幂等：再次移除为无操作
        assert!(!manager.remove(b.id).await);
    }

    #[tokio::test]
    async fn test_remove_uploading_job_aborts_first() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(1));

        let a = manager.queue(data_job("a")).await.unwrap();
        let b = manager.queue(data_job("b")).await.unwrap();
        assert_eq!(status_of(&manager, a.id).await, UploadStatus::Uploading);

        let mut events = manager.subscribe();
        assert!(manager.remove(a.id).await);

        // 中止事件先于移除事件
        let mut kinds = Vec::new();
        for _ in 0..3 {
            let event = events.recv().await.unwrap();
            kinds.push((event.event_type_name(), event.job_id()));
        }
        assert_eq!(kinds[0], ("aborted", Some(a.id)));
        let removed_pos = kinds
            .iter()
            .position(|k| *k == ("removed", Some(a.id)))
            .expect("应有移除事件");
        assert!(removed_pos > 0);

        // 中止投递失败结果，槽位释放后 b 准入
        let result = a.result.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.job.state.status, UploadStatus::Aborted);
        wait_for_status(&manager, b.id, UploadStatus::Uploading).await;
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_finished_keeps_live_jobs() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(1));

        let a = manager.queue(data_job("a")).await.unwrap();
        let b = manager.queue(data_job("b")).await.unwrap();
        let c = manager.queue(data_job("c")).await.unwrap();
        let d = manager.queue(data_job("d")).await.unwrap();

        fake.finish(&url_of("a"), 200).await;
        wait_for_status(&manager, b.id, UploadStatus::Uploading).await;
        fake.fail(&url_of("b")).await;
        wait_for_status(&manager, c.id, UploadStatus::Uploading).await;

        assert_eq!(status_of(&manager, a.id).await, UploadStatus::Completed);
        assert_eq!(status_of(&manager, b.id).await, UploadStatus::Failed);
        assert_eq!(status_of(&manager, d.id).await, UploadStatus::Queued);

        // 只移除已结束的任务
        assert_eq!(manager.remove_finished().await, 2);
        assert!(manager.get_job(a.id).await.is_none());
        assert!(manager.get_job(b.id).await.is_none());
        assert_eq!(status_of(&manager, c.id).await, UploadStatus::Uploading);
        assert_eq!(status_of(&manager, d.id).await, UploadStatus::Queued);
    }

    #[tokio::test]
    async fn test_remove_all_aborts_active() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(1));

        let a = manager.queue(data_job("a")).await.unwrap();
        let _b = manager.queue(data_job("b")).await.unwrap();

        assert_eq!(manager.remove_all().await, 2);
        assert!(manager.get_all_jobs().await.is_empty());
        assert_eq!(manager.active_count(), 0);

        let result = a.result.await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_auto_remove_on_success() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(2));

        let a = manager
            .queue(data_job("a").with_auto_remove(true, false))
            .await
            .unwrap();
        let b = manager.queue(data_job("b")).await.unwrap();

        fake.finish(&url_of("a"), 200).await;
        wait_for_absent(&manager, a.id).await;
        let result = a.result.await.unwrap();
        assert!(result.success);

        fake.finish(&url_of("b"), 200).await;
        wait_for_status(&manager, b.id, UploadStatus::Completed).await;
        assert!(manager.get_job(b.id).await.is_some());
    }

    #[tokio::test]
    async fn test_auto_remove_on_failure() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(2));

        let a = manager
            .queue(data_job("a").with_auto_remove(false, true))
            .await
            .unwrap();
        let b = manager.queue(data_job("b")).await.unwrap();

        fake.fail(&url_of("a")).await;
        wait_for_absent(&manager, a.id).await;
        let result = a.result.await.unwrap();
        assert!(!result.success);

        // 默认不自动清理：失败任务保留在集合中
        fake.fail(&url_of("b")).await;
        wait_for_status(&manager, b.id, UploadStatus::Failed).await;
        assert!(manager.get_job(b.id).await.is_some());
    }

    #[tokio::test]
    async fn test_protocol_failure_classification() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(2));

        let a = manager.queue(data_job("a")).await.unwrap();
        let b = manager.queue(data_job("b")).await.unwrap();

        // 状态码 >= 400 归类为协议失败
        fake.finish(&url_of("a"), 503).await;
        wait_for_status(&manager, a.id, UploadStatus::Failed).await;
        let job = manager.get_job(a.id).await.unwrap();
        assert!(
            job.state.message.contains("HTTP 503"),
            "{}",
            job.state.message
        );
        assert!(!a.result.await.unwrap().success);

        // 传输层错误同样终止于失败，仅消息文本不同
        fake.fail(&url_of("b")).await;
        wait_for_status(&manager, b.id, UploadStatus::Failed).await;
        let job = manager.get_job(b.id).await.unwrap();
        assert!(
            job.state.message.contains("failed:"),
            "{}",
            job.state.message
        );
        assert!(!b.result.await.unwrap().success);
    }

    #[tokio::test]
    async fn test_progress_updates_state_and_events() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(1));
        let mut events = manager.subscribe();

        let a = manager.queue(data_job("a")).await.unwrap();
        let call = fake.take_call(&url_of("a")).await;

        call.progress
            .send(TransportProgress {
                transferred: 4,
                total: 8,
            })
            .unwrap();

        // 状态整体替换为带进度的上传中
        for _ in 0..400 {
            if manager.get_job(a.id).await.unwrap().state.percent == 50.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let job = manager.get_job(a.id).await.unwrap();
        assert_eq!(job.state.status, UploadStatus::Uploading);
        assert_eq!(job.state.percent, 50.0);
        assert_eq!(job.state.message, "a [50%]");

        // 进度事件携带字节数与百分比
        let progress_event = loop {
            match events.recv().await.unwrap() {
                UploadEvent::Progress {
                    transferred,
                    total,
                    progress,
                    ..
                } => break (transferred, total, progress),
                _ => continue,
            }
        };
        assert_eq!(progress_event, (4, 8, 50.0));

        let _ = call.respond.send(Ok(TransportResponse { status: 200 }));
        wait_for_status(&manager, a.id, UploadStatus::Completed).await;
        assert_eq!(manager.get_job(a.id).await.unwrap().state.percent, 100.0);
    }

    #[tokio::test]
    async fn test_resubmission_rejected() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(1));

        let mut job = data_job("a");
        job.id = Some(9);
        assert!(manager.queue(job).await.is_err());

        let mut job = data_job("b");
        job.id = Some(9);
        assert!(manager.immediate(job).await.is_err());
        assert!(manager.get_all_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_raising_ceiling_admits_waiting_job() {
        let fake = FakeTransport::new();
        let manager = UploadManager::with_config(fake.clone(), &test_config(1));

        let _a = manager.queue(data_job("a")).await.unwrap();
        let b = manager.queue(data_job("b")).await.unwrap();
        assert_eq!(status_of(&manager, b.id).await, UploadStatus::Queued);

        manager.set_max_active(2).await;
        assert_eq!(status_of(&manager, b.id).await, UploadStatus::Uploading);
        assert_eq!(manager.active_count(), 2);
    }

    fn lcg(state: u64) -> u64 {
        state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// 任意完成顺序下：调度准入数不超过上限，启动顺序保持 FIFO
        #[test]
        fn prop_ceiling_and_fifo_hold(job_count in 1usize..8, ceiling in 1usize..4, seed in any::<u64>()) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async move {
                let fake = FakeTransport::new();
                let manager = UploadManager::with_config(fake.clone(), &test_config(ceiling));
                let mut events = manager.subscribe();

                let mut ids = Vec::new();
                for i in 0..job_count {
                    let handle = manager.queue(data_job(&format!("job{}", i))).await.unwrap();
                    ids.push(handle.id);
                }

                let mut state = seed;
                for _ in 0..job_count {
                    // 从当前活跃调用中按种子取一个完成
                    let url = loop {
                        let calls = fake.calls.lock().await;
                        if !calls.is_empty() {
                            state = lcg(state);
                            break calls[(state as usize) % calls.len()].url.clone();
                        }
                        drop(calls);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    };
                    let finished_id = {
                        let index: usize = url.rsplit("job").next().unwrap().parse().unwrap();
                        ids[index]
                    };
                    fake.finish(&url, 200).await;
                    wait_for_status(&manager, finished_id, UploadStatus::Completed).await;

                    // 上传中的任务数始终不超过上限
                    let uploading = manager
                        .get_all_jobs()
                        .await
                        .iter()
                        .filter(|j| j.state.status == UploadStatus::Uploading)
                        .count();
                    assert!(uploading <= ceiling, "uploading={} ceiling={}", uploading, ceiling);
                }

                assert_eq!(manager.active_count(), 0);

                // 启动事件的序号应单调递增（FIFO）
                let mut started = Vec::new();
                while let Ok(event) = events.try_recv() {
                    if let UploadEvent::Started { job } = event {
                        started.push(job.id.unwrap());
                    }
                }
                assert_eq!(started.len(), job_count);
                let mut sorted = started.clone();
                sorted.sort_unstable();
                assert_eq!(started, sorted, "FIFO 启动顺序被破坏");
            });
        }
    }
}
