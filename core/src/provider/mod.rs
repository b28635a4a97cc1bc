//! Provider-neutral pieces of the generation pipeline. Wire adapters live in
//! the plugins crate.

pub mod extract;
pub mod message;
pub mod payload;
pub mod stream;
pub mod traits;

pub use extract::{extract_from_json, extract_image, normalize_image_url, scan_text, ProviderResponse};
pub use message::{ChatMessage, ContentPart, ImageUrl, InlineImage};
pub use payload::{encode_data_url, is_data_image_url, is_http_url, parse_data_url, DownloadedImage};
pub use stream::{DeltaTextAccumulator, LastJsonAccumulator, LineBuffer, StreamAccumulator};
pub use traits::{ImageDownloader, ImageProvider, ProviderFactory};
