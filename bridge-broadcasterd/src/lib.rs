pub mod advertiser;
pub mod battery;
pub mod config;
pub mod connections;
pub mod mdns;
