mod app;
mod model;
mod msg;
mod plugin;

#[cfg(test)]
mod test_support;

use std::process::ExitCode;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use app::{App, Collaborators};
use model::config::AppConfig;
use model::summary::Summary;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let debug = std::env::args()
        .skip(1)
        .any(|arg| arg.eq_ignore_ascii_case("debug"));
    let config = AppConfig::load()?;

    // Initialize logging to file (never stdout)
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "plugin-updater.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let default_filter = if debug {
        "plugin_updater=debug"
    } else {
        "plugin_updater=info"
    };
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!(config = ?config.general, "plugin-updater starting");
    println!(
        "Checking plugins in {} (profile {})",
        config.plugins_dir().display(),
        config.general.profile.label()
    );

    let app = App::new(config.clone(), Collaborators::live(&config)?)?;

    let cancel = app.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling run");
            cancel.cancel();
        }
    });

    match app.run().await {
        Ok(summary) => {
            print_summary(&summary);
            Ok(if summary.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Err(err) => {
            tracing::error!(error = %err, "run failed");
            eprintln!("plugin-updater: {err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_summary(summary: &Summary) {
    for status in &summary.statuses {
        println!("{status}");
    }

    if !summary.notices.is_empty() {
        println!();
        println!("Updates available:");
        for notice in &summary.notices {
            println!("  {notice}");
        }
    }

    if !summary.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &summary.warnings {
            println!("  {warning}");
        }
    }

    println!();
    println!("{}", summary.headline());
}
