pub mod context;
pub mod ports;
