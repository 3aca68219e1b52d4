// Print device and client changes for ten seconds

use adb_bridge::{BridgeConfig, BridgeEvent, DeviceMonitor};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("adb_bridge=debug")
        .init();

    let config = BridgeConfig::from_env();
    println!("Tracking devices on {}...", config.server_addr());

    let monitor = DeviceMonitor::new(config);
    let mut events = monitor.subscribe();
    monitor.start().await?;

    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                BridgeEvent::DeviceConnected { device } => {
                    println!("+ {} ({})", device.serial, device.state)
                }
                BridgeEvent::DeviceDisconnected { device } => println!("- {}", device.serial),
                BridgeEvent::DeviceStateChanged { device } => {
                    println!("~ {} is now {}", device.serial, device.state)
                }
                BridgeEvent::ClientListChanged { serial, clients } => {
                    for client in clients {
                        println!(
                            "  {} pid {} -> {:?} {:?}",
                            serial, client.pid, client.debugger_port, client.status
                        );
                    }
                }
                BridgeEvent::ClientStatusChanged { client } => {
                    println!("  pid {} {:?}", client.pid, client.status)
                }
            },
            _ = &mut deadline => break,
        }
    }

    for device in monitor.devices().await {
        println!("{} {}", device.serial, device.state);
    }

    monitor.stop().await;
    Ok(())
}
