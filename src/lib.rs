// Shared infrastructure
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Event model and transport
pub mod bus;
pub mod events;

// Routing and protection
pub mod broker;
pub mod connection_manager;
pub mod guards;
pub mod jobs;
pub mod relay;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;
pub mod tasks;
