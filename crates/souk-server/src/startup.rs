//! Server startup utilities.

use souk_config::AppConfig;
use tracing::info;

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
   _____             __
  / ___/____  __  __/ /__
  \__ \/ __ \/ / / / //_/
 ___/ / /_/ / /_/ / ,<
/____/\____/\__,_/_/|_|

      job coordination
    "#);
}

/// Prints what this process is serving.
pub fn print_startup_info(addr: &str, config: &AppConfig) {
    let separator = "=".repeat(60);
    info!("{}", separator);
    info!("Health:    http://{}/health/queues", addr);
    info!("API Docs:  http://{}/swagger-ui", addr);
    if config.observability.metrics_enabled {
        info!("Metrics:   http://{}{}", addr, config.observability.metrics_path);
    }
    let mut queues = config.jobs.queue_names();
    if queues.is_empty() {
        queues.push("default".to_string());
    }
    info!("Queues:    {}", queues.join(", "));
    info!("Scheduled: {} recurring job(s)", config.jobs.scheduler.jobs.len());
    info!("{}", separator);
}
