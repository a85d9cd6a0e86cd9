pub mod openai;
pub mod ports;
pub mod pricing;
pub mod service;

pub use openai::OpenAiProvider;
pub use ports::{AiProvider, GatewayError, ProviderError, VisionTemplate};
pub use service::GatewayServiceImpl;
