pub mod agent;
pub mod credentials;
pub mod errors;
pub mod firewall;
pub mod memory;
pub mod models;
pub mod prompt_template;
pub mod providers;
pub mod router;
pub mod session;
