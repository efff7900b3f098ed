pub mod archive;
pub mod clock;
pub mod logger;
pub mod mailbox;
pub mod motion;
pub mod orchestrator;
pub mod platform;
pub mod settings;
pub mod types;
