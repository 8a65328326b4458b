mod config;
mod dto;
mod error;
mod routes;
mod state;

use std::sync::Arc;

use ec_vmlayer::VmPlatform;
use ec_vmlayer::cache::Caches;
use ec_vmlayer::config::PlatformConfig;
use ec_vmlayer::dns::InMemoryDns;
use ec_vmlayer::progress;
use ec_vmlayer::ssh::CommandSshConnector;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::routes::api_router;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();
    let platform_config = PlatformConfig::from_env().expect("invalid platform configuration");

    // VM providers
    let providers = ec_infra::build_providers().expect("failed to build VM providers");
    tracing::info!(providers = ?providers.available(), "VM providers ready");
    let provider = providers
        .get(config.provider)
        .cloned()
        .expect("configured VM provider is not available");

    let ssh = Arc::new(CommandSshConnector::new(
        platform_config.ssh_user.clone(),
        platform_config.ssh_key_path.clone(),
    ));
    let (caches, clusters, apps, policies) = Caches::in_memory();
    let platform = Arc::new(
        VmPlatform::new(
            platform_config,
            provider,
            ssh,
            Arc::new(InMemoryDns::default()),
            caches,
        )
        .expect("failed to initialize VM platform"),
    );

    // Shared root LB setup runs in the background
    if config.setup_shared_root_lb {
        let platform = platform.clone();
        tokio::spawn(async move {
            let lb = platform.config().shared_root_lb_name.clone();
            let secgrp = platform.config().cloudlet_secgrp_name.clone();
            if let Err(e) = platform
                .setup_root_lb(&lb, &secgrp, &progress::logging(lb.clone()))
                .await
            {
                tracing::error!(lb = %lb, error = %e, "shared root LB setup failed");
            }
        });
    }

    let state = AppState {
        platform,
        clusters,
        apps,
        policies,
        config: config.clone(),
    };

    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("failed to bind listener");

    tracing::info!(addr = %config.listen_addr, "starting cloudlet controller API");

    axum::serve(listener, app).await.expect("server error");
}
