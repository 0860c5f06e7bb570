//! Bridge entry point: parses arguments and the configuration file, brings
//! up the fixed set of singleton modules in the same order and with the
//! same fatal-on-failure gating the original `main()` used, then hands off
//! to the controller's event loop.

use anyhow::{Context, Result};
use clap::Parser;

use gateway_protocol::ids::ModuleId;
use gateway_protocol::ids::{
    MODULE_BANDWIDTH_ID, MODULE_MQTT_ID, MODULE_SCRIPT_ID, MODULE_SERIAL_ID, MODULE_SIGUSR1_ID,
    MODULE_SIGUSR2_ID,
};
use gateway_protocol::registry::Registry;

use gateway_bridge::bandwidth;
use gateway_bridge::config::{self, Args, BridgeConfig};
use gateway_bridge::controller::Controller;
use gateway_bridge::mqtt::MqttLink;
use gateway_bridge::serial::SerialLink;
use gateway_bridge::signals::SignalStreams;

// The controller's event loop is a single task multiplexing serial, the bus,
// signals, and timers over one `tokio::select!` — it never needs a worker
// pool, so the runtime stays single-threaded.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let signal_streams = SignalStreams::new().context("installing signal handlers")?;

    let args = Args::parse();
    let contents = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config file {}", args.config.display()))?;
    let config = config::parse(&contents).context("parsing config file")?;

    init_tracing(&config, args.quiet);

    let mut registry = Registry::new(config.id.clone());
    let bridge_id = registry.bridge.id.clone();

    let mqtt_module = ModuleId::parse(MODULE_MQTT_ID).expect("fixed id is valid");
    registry.add_module(mqtt_module, bridge_id.clone());

    if accessible(&config.scripts_folder).await {
        let script_module = ModuleId::parse(MODULE_SCRIPT_ID).expect("fixed id is valid");
        registry.add_module(script_module, bridge_id.clone());
    } else {
        anyhow::bail!(
            "scripts folder {} is not accessible",
            config.scripts_folder.display()
        );
    }

    let mut bandwidth = None;
    if let Some(interface) = config.interface.clone() {
        if !accessible(std::path::Path::new("/proc/net/dev")).await {
            anyhow::bail!("/proc/net/dev is not accessible; cannot sample bandwidth");
        }
        let bandwidth_module = ModuleId::parse(MODULE_BANDWIDTH_ID).expect("fixed id is valid");
        registry.add_module(bandwidth_module, bridge_id.clone());
        bandwidth = Some(bandwidth::BandwidthSampler::new(interface));
    }

    let mut serial = None;
    if let Some(serial_cfg) = config.serial.clone() {
        let link = SerialLink::open(&serial_cfg)
            .with_context(|| format!("opening serial port {}", serial_cfg.port))?;
        serial = Some(link);
        registry.bridge.serial_ready = true;
        let serial_module = ModuleId::parse(MODULE_SERIAL_ID).expect("fixed id is valid");
        registry.add_module(serial_module, bridge_id.clone());
    }

    let sigusr1_module = ModuleId::parse(MODULE_SIGUSR1_ID).expect("fixed id is valid");
    registry.add_module(sigusr1_module, bridge_id.clone());
    let sigusr2_module = ModuleId::parse(MODULE_SIGUSR2_ID).expect("fixed id is valid");
    registry.add_module(sigusr2_module, bridge_id.clone());

    let mqtt = MqttLink::connect(
        bridge_id.as_str(),
        &config.mqtt_host,
        config.mqtt_port,
        config.mqtt_qos,
        &registry.bridge.status_topic.clone(),
    );
    let mut controller = Controller::new(config, registry, mqtt, serial, bandwidth, signal_streams);
    controller.run().await.context("running controller event loop")?;

    Ok(())
}

async fn accessible(path: &std::path::Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

fn init_tracing(config: &BridgeConfig, quiet: bool) {
    let level = if quiet {
        "warn"
    } else {
        match config.debug {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
