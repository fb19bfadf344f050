pub mod config;
pub mod debug;
pub mod history;
pub mod jobs;
pub mod reconcile;

pub use self::config::{get_config, update_config};
pub use debug::configure_debug_routes;
pub use history::get_history;
pub use jobs::configure_job_routes;
pub use reconcile::{job_state_callback, reconcile};
