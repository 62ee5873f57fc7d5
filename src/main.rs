use ir40_bridge::domain::settings::SettingsService;
use ir40_bridge::infrastructure::bluetooth::platform_transport;
use ir40_bridge::infrastructure::logging::init_logger;
use ir40_bridge::presentation::console::ConsoleApp;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?;

    let _logging_guard = init_logger(&settings.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    tracing::info!("Starting IR40 bridge");
    tracing::debug!("Settings file: {}", settings.path().display());

    let transport = platform_transport().await?;
    ConsoleApp::new(settings, transport).run().await
}
