//! Line-oriented console that drives the Bluetooth workflow from stdin.

use crate::domain::models::{BluetoothCommand, ConnectionState, Peripheral};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::BluetoothHandle;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

const HELP: &str = "commands: init | scan | stop | devices | connect <id> | disconnect <id> | \
toggle | name <name> | state | help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Init,
    Scan,
    Stop,
    Devices,
    Connect(String),
    Disconnect(String),
    Toggle,
    Name(String),
    State,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// `None` for blank lines; `Some(Err)` carries a message for the user
    pub fn parse(line: &str) -> Option<Result<Self, String>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let argument = |what: &str| {
            if rest.is_empty() {
                Err(format!("usage: {} <{}>", word, what))
            } else {
                Ok(rest.to_string())
            }
        };

        let command = match word.to_lowercase().as_str() {
            "init" => Ok(Self::Init),
            "scan" => Ok(Self::Scan),
            "stop" => Ok(Self::Stop),
            "devices" | "ls" => Ok(Self::Devices),
            "connect" => argument("id").map(Self::Connect),
            "disconnect" => argument("id").map(Self::Disconnect),
            "toggle" => Ok(Self::Toggle),
            "name" => argument("name").map(Self::Name),
            "state" => Ok(Self::State),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command '{}'", other)),
        };
        Some(command)
    }
}

pub struct Console {
    handle: BluetoothHandle,
    settings: SettingsService,
}

impl Console {
    pub fn new(handle: BluetoothHandle, settings: SettingsService) -> Self {
        Self { handle, settings }
    }

    /// Read commands until `quit` or end of input
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();
        stdout.write_all(format!("{}\n", HELP).as_bytes()).await?;

        loop {
            stdout.write_all(b"> ").await?;
            stdout.flush().await?;
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let command = match ConsoleCommand::parse(&line) {
                None => continue,
                Some(Ok(command)) => command,
                Some(Err(message)) => {
                    stdout.write_all(format!("{}\n", message).as_bytes()).await?;
                    continue;
                }
            };
            if command == ConsoleCommand::Quit {
                break;
            }
            let output = self.execute(command);
            if !output.is_empty() {
                stdout.write_all(output.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
            }
        }

        self.handle.send(BluetoothCommand::Shutdown);
        Ok(())
    }

    fn send(&self, command: BluetoothCommand) -> String {
        debug!("console -> {:?}", command);
        if self.handle.send(command) {
            String::new()
        } else {
            "bluetooth service is not running".to_string()
        }
    }

    /// Run one command and return what should be shown to the user
    pub fn execute(&mut self, command: ConsoleCommand) -> String {
        match command {
            ConsoleCommand::Init => self.send(BluetoothCommand::Init),
            ConsoleCommand::Scan => self.send(BluetoothCommand::StartScan),
            ConsoleCommand::Stop => self.send(BluetoothCommand::StopScan),
            ConsoleCommand::Toggle => self.send(BluetoothCommand::Toggle),
            ConsoleCommand::Devices => self.describe_devices(),
            ConsoleCommand::Connect(id) => {
                // Prefer what the scan saw so the connection carries name and RSSI
                let known = self.handle.state().select(|s| s.scan.devices.get(&id).cloned());
                let peripheral = match known {
                    Some(device) => {
                        Peripheral::new(device.id, Some(&device.name), Some(device.rssi))
                    }
                    None => Peripheral::new(id, None, None),
                };
                self.send(BluetoothCommand::Connect(peripheral))
            }
            ConsoleCommand::Disconnect(id) => self.send(BluetoothCommand::Disconnect(id)),
            ConsoleCommand::Name(name) => {
                if let Err(e) = self.settings.set_adapter_name(&name) {
                    warn!("Failed to persist adapter name: {}", e);
                }
                self.send(BluetoothCommand::SetAdapterName(name))
            }
            ConsoleCommand::State => {
                let snapshot = self.handle.state().snapshot();
                serde_json::to_string_pretty(&snapshot)
                    .unwrap_or_else(|e| format!("failed to render state: {}", e))
            }
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Quit => String::new(),
        }
    }

    fn describe_devices(&self) -> String {
        let state = self.handle.state().snapshot();
        let connected = match &state.connection.state {
            ConnectionState::Connected { device, .. } => Some(device.id.as_str()),
            _ => None,
        };
        let mut out = String::new();
        if state.scan.is_scanning {
            out.push_str("(scanning)\n");
        }
        if state.scan.devices.is_empty() {
            out.push_str("no devices discovered");
            return out;
        }
        for device in state.scan.devices.values() {
            let marker = if connected == Some(device.id.as_str()) { "*" } else { " " };
            out.push_str(&format!(
                "{} {:<20} {:>5} dBm  {}\n",
                marker, device.id, device.rssi, device.name
            ));
        }
        out.trim_end().to_string()
    }
}
