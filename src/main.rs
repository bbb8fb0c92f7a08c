//! PeekGuard Server
//!
//! Run with: cargo run
//!
//! Environment variables:
//! - PEEKGUARD_HOST: Bind address (default: 0.0.0.0)
//! - PEEKGUARD_PORT: Port number (default: 8080)
//! - PEEKGUARD_DATA_DIR: Directory for persisted subject state (default: in-memory only)
//! - PEEKGUARD_API_TOKEN: Bearer token required on every route but /health (default: none)
//! - PEEKGUARD_MAX_SAMPLES: Samples kept per subject (default: 1000)
//! - PEEKGUARD_MAX_ALERTS: Alerts kept per subject (default: 500)
//! - PEEKGUARD_SAMPLE_TIMEOUT_MS: Per-tick sampling timeout (default: 5000)
//! - PEEKGUARD_DELIVERY_TIMEOUT_MS: Per-channel delivery timeout (default: 3000)
//! - PEEKGUARD_DEGRADED_AFTER: Consecutive sampling failures before degraded (default: 3)
//! - PEEKGUARD_PEEK_PROBABILITY: Peek rate of the simulated sampler (default: 0.1)
//! - RUST_LOG: Log level (default: info)

use peekguard::api::run_server;
use peekguard::settings::ServiceSettings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peekguard=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = ServiceSettings::from_env();

    tracing::info!("PeekGuard configuration:");
    tracing::info!("  Host: {}:{}", settings.host, settings.port);
    match &settings.data_dir {
        Some(dir) => tracing::info!("  Data directory: {}", dir.display()),
        None => tracing::info!("  Data directory: none (in-memory)"),
    }
    tracing::info!(
        "  Authentication: {}",
        if settings.api_token.is_some() { "bearer token" } else { "disabled" }
    );
    tracing::info!(
        "  History capacity: {} samples, {} alerts per subject",
        settings.max_samples,
        settings.max_alerts
    );
    tracing::info!(
        "  Timeouts: sampling {} ms, delivery {} ms",
        settings.sample_timeout_ms,
        settings.delivery_timeout_ms
    );
    tracing::info!("  Degraded after: {} failures", settings.degraded_after);
    tracing::info!("  Simulated peek probability: {}", settings.peek_probability);

    println!(
        r#"
  ____            _     ____                     _
 |  _ \ ___  ___ | | __/ ___|_   _  __ _ _ __ __| |
 | |_) / _ \/ _ \| |/ / |  _| | | |/ _` | '__/ _` |
 |  __/  __/  __/|   <| |_| | |_| | (_| | | | (_| |
 |_|   \___|\___||_|\_\\____|\__,_|\__,_|_|  \__,_|

 Screen-Peek Detection and Alerting
 Version: {}
"#,
        env!("CARGO_PKG_VERSION")
    );

    run_server(settings).await
}
