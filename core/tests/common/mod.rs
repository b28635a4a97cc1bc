#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use moegen_core::api::{
    BackendService, ChatMessage, DownloadedImage, EventBus, GenError, GenResult, GlobalConfig,
    ImageDownloader, ImageProvider, ProviderFactory, SchedulerConfig, Services, Task,
};
use tokio_util::sync::CancellationToken;

/// What the scripted provider does on one call.
#[derive(Clone)]
pub enum Reply {
    Image(String),
    NoImage,
    Fail { status: u16, message: String },
    /// Block until cancelled.
    Hang,
}

pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn always(reply: Reply) -> Arc<Self> {
        Self::new(Vec::new(), reply)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_messages(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn request_image(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> GenResult<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Image(url) => Ok(Some(url)),
            Reply::NoImage => Ok(None),
            Reply::Fail { status, message } => Err(GenError::protocol(Some(status), message)),
            Reply::Hang => {
                cancel.cancelled().await;
                Err(GenError::Cancelled)
            }
        }
    }
}

struct FixedFactory(Arc<ScriptedProvider>);

impl ProviderFactory for FixedFactory {
    fn build(&self, _config: &GlobalConfig) -> GenResult<Arc<dyn ImageProvider>> {
        Ok(self.0.clone())
    }
}

struct StaticDownloader;

#[async_trait]
impl ImageDownloader for StaticDownloader {
    async fn download(&self, url: &str) -> GenResult<DownloadedImage> {
        Ok(DownloadedImage {
            bytes: url.as_bytes().to_vec(),
            content_type: "image/webp".to_string(),
        })
    }
}

pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        retry_delay_ms: 50,
        sweep_delay_ms: 20,
    }
}

pub async fn service_with(
    dir: &Path,
    provider: Arc<ScriptedProvider>,
    cfg: SchedulerConfig,
) -> BackendService {
    let services = Services {
        providers: Arc::new(FixedFactory(provider)),
        downloader: Arc::new(StaticDownloader),
    };
    BackendService::open(dir, EventBus::default(), services, &cfg)
        .await
        .unwrap()
}

pub async fn service(dir: &Path, provider: Arc<ScriptedProvider>) -> BackendService {
    service_with(dir, provider, scheduler_config()).await
}

/// A base64 PNG-ish payload long enough to pass extraction checks.
pub fn png_data_url(seed: &str) -> String {
    use base64::Engine as _;
    let bytes = seed.repeat(300).into_bytes();
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Poll the task until `pred` holds or the timeout elapses.
pub async fn wait_for_task<F>(service: &BackendService, task_id: &str, pred: F) -> Task
where
    F: Fn(&Task) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = service
            .store()
            .load_task(task_id)
            .await
            .unwrap()
            .expect("task exists");
        if pred(&task) {
            return task;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for task {task_id}: {task:#?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn image_files(dir: &Path) -> Vec<String> {
    let images = dir.join("images");
    let mut names: Vec<String> = std::fs::read_dir(images)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
