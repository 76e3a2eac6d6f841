use anyhow::Context;

use hsj_operator::config::Settings;
use hsj_operator::store::{PodState, StateMonitor};

use crate::cli::StoreAction;

pub async fn run(action: StoreAction) -> anyhow::Result<()> {
    let settings = Settings::from_env();
    let Some(redis) = settings.redis else {
        anyhow::bail!("REDIS_HOST is not set; the pod-state store is not configured");
    };

    let monitor = StateMonitor::connect(&redis)
        .await
        .context("Cannot open pod-state store")?;

    match action {
        StoreAction::Summary => {
            let summary = monitor.summary().await?;
            println!("Pod-state store: {} (hash '{}')\n", redis.url(), monitor.key());
            println!("  Total ....... {}", summary.total);
            println!("  Starting .... {}", summary.starting);
            println!("  Idle ........ {}", summary.idle);
            println!("  Busy ........ {}", summary.busy);
            println!("  Error ....... {}", summary.error);

            let errored = monitor.list_by_status(PodState::Error).await?;
            if !errored.is_empty() {
                println!("\n  Pods in error state:");
                for pod in errored {
                    println!("    {pod}");
                }
            }
        }
        StoreAction::Cleanup { timeout_seconds } => {
            let removed = monitor.cleanup_stale(timeout_seconds).await?;
            println!("Removed {removed} stale record(s)");
        }
        StoreAction::Remove { pod_name } => {
            if monitor.remove(&pod_name).await? {
                println!("Removed record for '{pod_name}'");
            } else {
                println!("No record found for '{pod_name}'");
            }
        }
        StoreAction::Clear => {
            monitor.clear_all().await?;
            println!("Cleared all pod-state records");
        }
    }

    Ok(())
}
