//! Stable re-exports for consumers (`cli`, `plugins`, and external crates).
//!
//! Prefer importing from `moegen_core::api` instead of reaching into internal modules.

pub use crate::config::{
    load_default, AppConfig, AuthConfig, LoggingConfig, ProviderConfig, SchedulerConfig,
    ServerConfig, StorageConfig,
};
pub use crate::context::{Services, ServicesFactory};
pub use crate::error::{CliError, ErrorCode, GenError, GenResult, TransportKind};
pub use crate::events::{BackendEvent, EventBus};
pub use crate::model::{
    image_route, ApiFormat, BackendState, CollectionItem, GlobalConfig, StatePatch, Stats,
    SubtaskResult, SubtaskStatus, Task, UploadedImage,
};
pub use crate::provider::{
    extract_image, ChatMessage, ContentPart, DeltaTextAccumulator, DownloadedImage,
    ImageDownloader, ImageProvider, LastJsonAccumulator, LineBuffer, ProviderFactory,
    ProviderResponse, StreamAccumulator,
};
pub use crate::scheduler::{StopMode, SubtaskScheduler};
pub use crate::service::{BackendService, StoredImage, TaskPatch};
pub use crate::storage::{DataLayout, ImageGc, ImageStore, SavedImage, TaskStore};
