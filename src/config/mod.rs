//! Configuration Module
//!
//! Handles loading provider, model and router configuration.

pub mod loader;
pub mod provider;

pub use loader::ConfigLoader;
pub use provider::{
    EndpointConfig, GatewayConfig, KeyConfig, ModelConfig, ModelProviderConfig, ProviderConfig,
    ProviderStyle, RouterConfig,
};
