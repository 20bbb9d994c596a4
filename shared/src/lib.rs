pub mod protocol;
pub mod retry;
pub mod session;
pub mod status;
pub mod types;
pub mod wire;
