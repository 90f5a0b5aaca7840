pub mod context;
pub mod credentials;
pub mod directive;
pub mod errors;
pub mod events;
pub mod history;
pub mod ids;
pub mod provider;
pub mod stream;
pub mod tokens;
pub mod tools;
pub mod transport;
