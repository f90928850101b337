pub mod config;
pub mod error;
pub mod mesh;
pub mod protocol;
pub mod relay;
pub mod runtime;
pub mod vertex;
