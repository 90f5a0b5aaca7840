pub mod converter;
pub mod counter;
pub mod provider;
pub mod rotation;
pub mod sse;

pub mod mock;

pub use counter::RemoteTokenCounter;
pub use mock::{MockProvider, MockResponse};
pub use provider::GeminiProvider;
pub use rotation::{build_slots, GatewayStats, RotatingGateway, RotationConfig};
