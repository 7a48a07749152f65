use ble_workflow::domain::models::BluetoothCommand;
use ble_workflow::domain::settings::SettingsService;
use ble_workflow::infrastructure::bluetooth::events::EventBridge;
use ble_workflow::infrastructure::bluetooth::simulated::{SimulatedAdapter, SimulatedPermissions};
use ble_workflow::infrastructure::bluetooth::{BluetoothHandle, BluetoothService};
use ble_workflow::infrastructure::logging::init_logger;
use ble_workflow::presentation::console::Console;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().unwrap_or_else(|e| {
        eprintln!("No config directory ({}), using ./settings.json", e);
        SettingsService::with_path(PathBuf::from("settings.json"))
    });
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    tracing::info!(
        "Starting BLE workflow (simulated {:?} adapter)",
        settings.platform
    );

    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let adapter = Arc::new(SimulatedAdapter::with_sample_data(settings.platform, notify_tx));
    let bridge = EventBridge::new(notify_rx, settings.ble.discovery_throttle());
    let (service, reader) = BluetoothService::new(
        adapter,
        Arc::new(SimulatedPermissions::granted()),
        settings.ble.clone(),
    );
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let handle = BluetoothHandle::new(cmd_tx, reader);

    let bt_thread = std::thread::Builder::new()
        .name("bluetooth".to_string())
        .spawn(move || -> anyhow::Result<()> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(service.run(cmd_rx, bridge));
            Ok(())
        })?;

    handle.send(BluetoothCommand::Init);
    if let Some(name) = settings.ble.adapter_name.clone() {
        handle.send(BluetoothCommand::SetAdapterName(name));
    }

    let console_rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    // The console owns the last command sender; the dispatcher stops once it is dropped
    let result = console_rt.block_on(Console::new(handle, settings_service).run());

    match bt_thread.join() {
        Ok(outcome) => outcome?,
        Err(_) => anyhow::bail!("bluetooth thread panicked"),
    }
    tracing::info!("BLE workflow stopped");
    result
}
