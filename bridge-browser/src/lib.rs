pub mod config;
pub mod discoverer;
pub mod mdns;
pub mod presenter;
