use std::sync::Arc;

use kickr_bridge::gears::GearController;
use kickr_bridge::mdns::MdnsAdvertiser;
use kickr_bridge::mirror::GattMirror;
use kickr_bridge::ride::RideState;
use kickr_bridge::trainer::{IoState, SocketIncline};
use kickr_bridge::{config, ftms, ride, server, trainer, uuids};

const DEFAULT_CONFIG: &str = "bridge_config.json";
const DEFAULT_SOCKET: &str = "/tmp/trainer_io.sock";

struct Args {
    config_path: String,
    socket_path: String,
    port: u16,
    max_clients: usize,
    no_ble: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = parse_args();
    log::info!(
        "KICKR bridge starting, config: {}, io socket: {}, port: {}",
        args.config_path,
        args.socket_path,
        args.port
    );

    let config = config::load_or_create(&args.config_path);

    // Single mirror handle shared by every component.
    let mirror = Arc::new(GattMirror::new());
    let io_state = Arc::new(tokio::sync::Mutex::new(IoState::default()));
    let incline = Arc::new(SocketIncline::new(args.socket_path.clone()));
    let controller = Arc::new(GearController::new(mirror.clone(), incline));
    let ride_state = Arc::new(RideState::new());

    // Service registration order is the order discovery reports.
    let registered = kickr_bridge::register_device_profile(&mirror)
        .and_then(|_| ftms::register(&mirror, &controller))
        .and_then(|_| ride::register(&mirror, &controller, &ride_state));
    if let Err(e) = registered {
        log::error!("GATT registration failed: {}", e);
        return;
    }

    let advertiser = match MdnsAdvertiser::new(&config.serial, &config.mac, args.port) {
        Ok(advertiser) => advertiser,
        Err(e) => {
            log::error!("mDNS advertiser failed to start: {}", e);
            return;
        }
    };
    if let Err(e) = advertiser.publish() {
        log::error!("mDNS publish failed: {}", e);
        return;
    }
    for service in mirror.service_uuids() {
        if let Some(short) = uuids::short_form(&service) {
            advertiser.add_service_uuid(short);
        }
    }

    let device_name = config.device_name();
    let no_ble = args.no_ble;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("received shutdown signal");
        }
        result = server::run(mirror.clone(), args.port, args.max_clients) => {
            if let Err(e) = result {
                log::error!("TNP server exited with error: {}", e);
            }
        }
        _ = trainer::run(io_state.clone(), &args.socket_path) => {}
        _ = trainer::run_shifter_poll(io_state.clone(), controller.clone()) => {}
        _ = ride::run_timers(mirror.clone(), ride_state.clone(), controller.clone()) => {}
        result = async {
            if no_ble {
                futures::future::pending().await
            } else {
                kickr_bridge::ble::run(mirror.clone(), device_name).await
            }
        } => {
            if let Err(e) = result {
                log::error!("BLE peripheral exited with error: {}", e);
            }
        }
    }

    advertiser.shutdown();
    log::info!("KICKR bridge shutting down");
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    let mut args = Args {
        config_path: DEFAULT_CONFIG.to_string(),
        socket_path: DEFAULT_SOCKET.to_string(),
        port: server::TNP_PORT,
        max_clients: server::DEFAULT_MAX_CLIENTS,
        no_ble: false,
    };
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" => {
                if let Some(path) = argv.get(i + 1) {
                    args.config_path = path.clone();
                    i += 1;
                }
            }
            "--io-socket" => {
                if let Some(path) = argv.get(i + 1) {
                    args.socket_path = path.clone();
                    i += 1;
                }
            }
            "--port" => {
                if let Some(port) = argv.get(i + 1) {
                    args.port = port.parse().unwrap_or(server::TNP_PORT);
                    i += 1;
                }
            }
            "--max-clients" => {
                if let Some(n) = argv.get(i + 1) {
                    args.max_clients = n.parse().unwrap_or(server::DEFAULT_MAX_CLIENTS);
                    i += 1;
                }
            }
            "--no-ble" => {
                args.no_ble = true;
            }
            _ => {}
        }
        i += 1;
    }
    args
}
