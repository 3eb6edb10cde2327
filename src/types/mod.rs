//! Configuration types

mod config;


pub use config::{
    CLOCK_PORT, ClientConfig, ClientConfigBuilder, ClockClientConfig, ClockServiceConfig,
    EvictionPolicy, ServerConfig, ServerConfigBuilder,
};
