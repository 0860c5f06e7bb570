//! CLI arguments and the bridge's key-value configuration file.
//!
//! The file format itself is not TOML: it is the flat, whitespace-separated
//! `key value` scheme the bridge has always used, one key per line, `#` and
//! blank lines ignored. Parsed the same way the original did — one match arm
//! per key, validated once all lines are consumed — rather than pretending
//! it is a format `serde` already understands.

use std::path::PathBuf;

use clap::Parser;
use gateway_protocol::ids::DeviceId;

const VALID_BAUD_RATES: &[u32] = &[4800, 9600, 14400, 19200, 28800, 38400, 57600, 115200];
const DEFAULT_BAUDRATE: u32 = 9600;
const DEFAULT_TIMEOUT_MS: u32 = 100;
const DEFAULT_QOS: u8 = 0;

#[derive(Parser, Debug)]
#[command(name = "gateway-bridge", about = "MQTT/serial gateway bridge")]
pub struct Args {
    /// Path to the bridge's configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Force the minimum debug level regardless of the config file
    #[arg(long)]
    pub quiet: bool,
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baudrate: u32,
    pub timeout_ms: u32,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub debug: u8,
    pub id: DeviceId,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_qos: u8,
    pub devices_folder: PathBuf,
    pub scripts_folder: PathBuf,
    pub interface: Option<String>,
    pub serial: Option<SerialConfig>,
    pub remap_usr1: Option<String>,
    pub remap_usr2: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("missing required key 'id'")]
    MissingId,
    #[error("'id' must be a valid 9-character device id")]
    InvalidId,
    #[error("'baudrate'/'timeout' without a preceding 'port' at line {line}")]
    SerialFieldWithoutPort { line: usize },
}

/// Builder mirroring the original parser's mutable accumulator, one field
/// set per recognised key.
#[derive(Default)]
struct Builder {
    debug: Option<u8>,
    id: Option<String>,
    mqtt_host: Option<String>,
    mqtt_port: Option<u16>,
    mqtt_qos: Option<u8>,
    devices_folder: Option<PathBuf>,
    scripts_folder: Option<PathBuf>,
    interface: Option<String>,
    port: Option<String>,
    baudrate: Option<u32>,
    timeout_ms: Option<u32>,
    remap_usr1: Option<String>,
    remap_usr2: Option<String>,
}

pub fn parse(contents: &str) -> Result<BridgeConfig, ConfigError> {
    let mut builder = Builder::default();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim_end_matches(['\r', '\n']).trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once(char::is_whitespace) else {
            return Err(ConfigError::Parse {
                line: line_no,
                message: format!("missing value for key '{line}'"),
            });
        };
        let value = value.trim();

        match key {
            "debug" => {
                builder.debug = Some(parse_ranged(value, 0, 4, line_no)? as u8);
            }
            "id" => {
                builder.id = Some(value.to_string());
            }
            "mqtt_host" => {
                builder.mqtt_host = Some(value.to_string());
            }
            "mqtt_port" => {
                builder.mqtt_port = Some(parse_ranged(value, 1, 65535, line_no)? as u16);
            }
            "mqtt_qos" => {
                builder.mqtt_qos = Some(parse_ranged(value, 0, 2, line_no)? as u8);
            }
            "devices_folder" => {
                builder.devices_folder = Some(PathBuf::from(value));
            }
            "scripts_folder" => {
                builder.scripts_folder = Some(PathBuf::from(value));
            }
            "interface" => {
                builder.interface = Some(value.to_string());
            }
            "port" => {
                builder.port = Some(value.to_string());
                builder.baudrate.get_or_insert(DEFAULT_BAUDRATE);
                builder.timeout_ms.get_or_insert(DEFAULT_TIMEOUT_MS);
            }
            "baudrate" => {
                if builder.port.is_none() {
                    return Err(ConfigError::SerialFieldWithoutPort { line: line_no });
                }
                let baud: u32 = value.parse().map_err(|_| ConfigError::Parse {
                    line: line_no,
                    message: format!("invalid baudrate '{value}'"),
                })?;
                if !VALID_BAUD_RATES.contains(&baud) {
                    return Err(ConfigError::Parse {
                        line: line_no,
                        message: format!("unsupported baudrate '{baud}'"),
                    });
                }
                builder.baudrate = Some(baud);
            }
            "timeout" => {
                if builder.port.is_none() {
                    return Err(ConfigError::SerialFieldWithoutPort { line: line_no });
                }
                builder.timeout_ms = Some(parse_ranged(value, 0, u32::MAX, line_no)?);
            }
            "remap_usr1" => {
                builder.remap_usr1 = Some(value.to_string());
            }
            "remap_usr2" => {
                builder.remap_usr2 = Some(value.to_string());
            }
            other => {
                tracing::warn!(line = line_no, key = other, "unknown configuration key");
            }
        }
    }

    let id_str = builder.id.ok_or(ConfigError::MissingId)?;
    let id = DeviceId::parse(&id_str).ok_or(ConfigError::InvalidId)?;

    let serial = builder.port.map(|port| SerialConfig {
        port,
        baudrate: builder.baudrate.unwrap_or(DEFAULT_BAUDRATE),
        timeout_ms: builder.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
    });

    Ok(BridgeConfig {
        debug: builder.debug.unwrap_or(0),
        id,
        mqtt_host: builder.mqtt_host.unwrap_or_else(|| "localhost".to_string()),
        mqtt_port: builder.mqtt_port.unwrap_or(1883),
        mqtt_qos: builder.mqtt_qos.unwrap_or(DEFAULT_QOS),
        devices_folder: builder
            .devices_folder
            .unwrap_or_else(|| PathBuf::from("devices")),
        scripts_folder: builder
            .scripts_folder
            .unwrap_or_else(|| PathBuf::from("scripts")),
        interface: builder.interface,
        serial,
        remap_usr1: builder.remap_usr1,
        remap_usr2: builder.remap_usr2,
    })
}

fn parse_ranged(value: &str, min: u32, max: u32, line: usize) -> Result<u32, ConfigError> {
    let parsed: u32 = value.parse().map_err(|_| ConfigError::Parse {
        line,
        message: format!("invalid integer '{value}'"),
    })?;
    if parsed < min || parsed > max {
        return Err(ConfigError::Parse {
            line,
            message: format!("value '{parsed}' out of range [{min}, {max}]"),
        });
    }
    Ok(parsed)
}
