#![cfg_attr(not(windows), allow(dead_code))]

mod domain;
mod infrastructure;
mod presentation;

use crate::domain::settings::SettingsService;
use crate::infrastructure::logging;
use clap::Parser;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Console client for the ESP32 smart box
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(name = "smartbox-client")]
#[command(about = "Connects to the smart box over BLE and manages its slots")]
struct Args {
    /// Advertised device name for this run (settings.json is left untouched)
    #[arg(short, long)]
    device: Option<String>,

    /// Start without connecting; use the `connect` command later
    #[arg(long)]
    no_connect: bool,
}

/// Apply per-run overrides in memory only
fn apply_overrides(args: &Args, settings: &mut SettingsService) {
    if let Some(name) = &args.device {
        settings.get_mut().device_name = name.clone();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings_service = SettingsService::new()?;
    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)?;
    info!("Starting Smartbox client");

    apply_overrides(&args, &mut settings_service);
    info!(
        "Settings: {} (device {:?})",
        settings_service.path().display(),
        settings_service.get().device_name
    );

    run(Arc::new(Mutex::new(settings_service)), !args.no_connect).await
}

#[cfg(windows)]
async fn run(settings: Arc<Mutex<SettingsService>>, connect_on_start: bool) -> anyhow::Result<()> {
    use crate::infrastructure::bluetooth::{winrt::WinRtTransport, SmartboxService};

    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    let transport = Arc::new(WinRtTransport::new());
    let service = SmartboxService::new(transport, event_tx, settings)?;
    presentation::console::run(service, event_rx, connect_on_start).await
}

#[cfg(not(windows))]
async fn run(_settings: Arc<Mutex<SettingsService>>, _connect_on_start: bool) -> anyhow::Result<()> {
    anyhow::bail!("No BLE transport is available for this platform")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("smartbox-client").chain(list.iter().copied()))
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(
            args(&[]).unwrap(),
            Args {
                device: None,
                no_connect: false,
            }
        );
        assert_eq!(
            args(&["--device", "SmartboxHSE", "--no-connect"]).unwrap(),
            Args {
                device: Some("SmartboxHSE".to_string()),
                no_connect: true,
            }
        );
        assert_eq!(args(&["-d", "Box2"]).unwrap().device.as_deref(), Some("Box2"));
        assert!(args(&["--device"]).is_err());
        assert!(args(&["--verbose"]).is_err());
    }

    #[test]
    fn test_device_override_is_not_saved() {
        let dir = std::env::temp_dir().join(format!("smartbox-args-{}", std::process::id()));
        let path = dir.join("settings.json");
        let mut settings = SettingsService::with_path(path.clone());

        apply_overrides(&args(&["-d", "SmartboxHSE"]).unwrap(), &mut settings);
        assert_eq!(settings.get().device_name, "SmartboxHSE");
        assert!(!path.exists());

        apply_overrides(&args(&[]).unwrap(), &mut settings);
        assert_eq!(settings.get().device_name, "SmartboxHSE");
    }
}
