pub mod authenticator;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod crawler;
pub mod dns;
pub mod email;
pub mod maildir;
pub mod malware;
pub mod notifier;
pub mod pipeline;
pub mod processor;
pub mod rate_limit;
pub mod report;
pub mod screenshots;
pub mod service;
pub mod threat;
pub mod upload;
pub mod whitelist;

pub use config::Config;
pub use maildir::{MailHandler, MaildirWatcher};
pub use pipeline::Orchestrator;
pub use report::Report;
pub use service::Services;
