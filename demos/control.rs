//! Drive a smart clock from the command line
//!
//! ```text
//! cargo run --example control -- 192.168.1.50:80 alarm 6 30 1
//! cargo run --example control -- 192.168.1.50 snooze
//! cargo run --example control -- listen
//! ```

use smartclock_control::{AlarmSettings, ClockClient, DeviceRecord, DeviceGateway};
use std::env;

fn usage() -> ! {
    eprintln!("usage: control <address[:port]> <alarm H M [SOUND] | alarm-off H M | button NAME | snooze | reset | sleep-reset>");
    eprintln!("       control devices");
    eprintln!("       control forget <address>");
    eprintln!("       control listen");
    std::process::exit(2);
}

async fn run_intent(gateway: &DeviceGateway, args: &[String]) -> smartclock_control::Result<()> {
    let number = |i: usize| -> u8 {
        args.get(i)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| usage())
    };

    match args.first().map(String::as_str) {
        Some("alarm") => {
            let sound = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(0);
            gateway
                .set_alarm(AlarmSettings::new(number(1), number(2), sound), true)
                .await?;
        }
        Some("alarm-off") => {
            gateway
                .set_alarm(AlarmSettings::new(number(1), number(2), 0), false)
                .await?;
        }
        Some("button") => {
            let name = args.get(1).unwrap_or_else(|| usage());
            gateway.press_button(name).await?;
        }
        Some("snooze") => {
            gateway.snooze_alarm().await?;
        }
        Some("reset") => {
            gateway.reset_device().await?;
        }
        Some("sleep-reset") => {
            gateway.reset_sleep_timer().await?;
        }
        _ => usage(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let client = ClockClient::from_env();

    match args.first().map(String::as_str) {
        None => usage(),
        Some("devices") => {
            for device in client.saved_devices().await? {
                println!("{}", device);
            }
        }
        Some("forget") => {
            let address = args.get(1).unwrap_or_else(|| usage());
            if !client.remove_device(address).await? {
                eprintln!("{} was not saved", address);
            }
        }
        Some("listen") => {
            let mut channel = client.connect_notifications().await?;
            let mut notifications = channel.notifications();
            let status_topic = channel.topics().status.clone();
            channel.subscribe(&status_topic).await?;
            channel.request_status().await?;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    notification = notifications.recv() => match notification {
                        Ok(n) => println!("{}: {}", n.topic, n.data),
                        Err(e) => eprintln!("{}", e),
                    },
                }
            }
            channel.disconnect().await;
        }
        Some(target) => {
            let record: DeviceRecord = target.parse()?;
            let gateway = client.find_device(&record.address, record.port).await?;
            let result = run_intent(&gateway, &args[1..]).await;

            for entry in client.log().entries() {
                println!("[{}] {:?}: {}", entry.timestamp, entry.severity, entry.text);
            }
            result?;
        }
    }

    Ok(())
}
