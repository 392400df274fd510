/**
 * PPPWATCH KERNEL - Point d'entrée du moniteur d'abonnés PPPoE
 *
 * RÔLE : Orchestration : config, registre des routeurs, bus MQTT, API HTTP, health.
 * Un contexte de supervision par routeur activé dans la config.
 */

use anyhow::Context;
use pppwatch_kernel::baseline::{BaselineStore, JsonBaselineStore, NullBaselineStore};
use pppwatch_kernel::config::load_config;
use pppwatch_kernel::health::HealthTracker;
use pppwatch_kernel::http::{build_router, AppState};
use pppwatch_kernel::mqtt;
use pppwatch_kernel::registry::{MonitorRegistry, RouterSettings, SharedRegistry};
use pppwatch_kernel::upstream::RouterOsClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;

    // persistance des bases de débit
    let store: Arc<dyn BaselineStore> = match &cfg.monitor.baseline_dir {
        Some(dir) => match JsonBaselineStore::new(dir) {
            Ok(store) => {
                info!(dir = %dir.display(), "baseline persistence enabled");
                Arc::new(store)
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "baseline dir unusable, persistence disabled");
                Arc::new(NullBaselineStore)
            }
        },
        None => Arc::new(NullBaselineStore),
    };

    // client RouterOS partagé ; les contextes routeur sont créés après le câblage du bus
    let client = Arc::new(RouterOsClient::new());
    let registry: SharedRegistry = Arc::new(MonitorRegistry::new(client.clone(), store));

    let health_tracker = HealthTracker::new();

    // bus MQTT : push entrant, republication des snapshots, health
    match &cfg.mqtt {
        Some(mqtt_cfg) => {
            let (mqtt_client, eventloop) = mqtt::create_mqtt_client(mqtt_cfg);
            mqtt::spawn_mqtt_listener(mqtt_client.clone(), eventloop, registry.clone(), health_tracker.clone());
            let publisher = Arc::new(mqtt_client);
            mqtt::spawn_republisher(&registry, publisher.clone());
            health_tracker.spawn_health_publisher(registry.clone(), publisher, Duration::from_secs(30));
            info!(host = %mqtt_cfg.host, port = mqtt_cfg.port, "MQTT bus enabled");
        }
        None => {
            health_tracker.mark_mqtt_disabled();
            info!("no MQTT config, push bus disabled");
        }
    }

    // premier cycle immédiat : le republisher doit déjà être abonné
    for (router_id, router) in cfg.routers.iter().filter(|(_, r)| r.enabled) {
        client.register(router_id, router.endpoint());
        registry.attach(
            router_id,
            RouterSettings {
                name: router.display_name(router_id).to_string(),
                monitor: cfg.monitor_settings(Some(router)),
            },
        );
    }
    info!(routers = registry.len(), "router monitors started");

    let api_key = std::env::var("PPPWATCH_API_KEY").ok().filter(|k| !k.is_empty());
    if api_key.is_none() {
        warn!("PPPWATCH_API_KEY not set, only /health will answer");
    }

    let app = build_router(AppState {
        registry: registry.clone(),
        health_tracker,
        api_key,
    });

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    info!("listening on http://{}", cfg.http.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server error")?;

    registry.shutdown_all();
    info!("kernel stopped");
    Ok(())
}
