use csi_runtime::config;
use csi_runtime::plugin::StoragePlugin;
use mock_provider::MockPlugin;

#[tokio::main]
async fn main() {
    init_tracing();

    // The mock backend implements all three CSI services; the harness wires
    // them into the middleware pipeline and serves X_CSI_ENDPOINT.
    let service = MockPlugin::new("mock-node");
    let plugin = StoragePlugin {
        controller: Some(service.clone()),
        identity: Some(service.clone()),
        node: Some(service),
        before_serve: Some(Box::new(|config| {
            tracing::debug!(?config, "BeforeServe");
            Ok(())
        })),
        env_vars: vec![
            // Enable serial volume access.
            format!("{}=true", config::ENV_SERIAL_VOL_ACCESS),
            // Enable request and response validation.
            format!("{}=true", config::ENV_SPEC_VALIDATION),
            // Treat publish contexts as required fields.
            format!("{}=true", config::ENV_REQUIRE_PUB_CONTEXT),
        ],
    };

    if let Err(error) = plugin.run().await {
        eprintln!("mock-csi-plugin: {:#}", error);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let level = std::env::var(config::ENV_LOG_LEVEL).unwrap_or_else(|_| {
        match std::env::var(config::ENV_DEBUG) {
            Ok(v) if v == "true" || v == "1" => "debug".to_owned(),
            _ => "info".to_owned(),
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();
}
