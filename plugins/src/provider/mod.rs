pub mod download;
pub mod gemini;
pub mod http;
pub mod openai;
pub mod url;

pub use download::HttpImageDownloader;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
