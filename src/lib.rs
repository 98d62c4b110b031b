pub mod config;
pub mod engine;
pub mod intake;
pub mod outbound;
pub mod presence;
pub mod registry;
pub mod slave;
pub mod supervisor;
pub mod types;
pub mod wire;
