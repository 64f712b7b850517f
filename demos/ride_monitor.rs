use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};
use ergolink::{
    adapter::{DeviceFamily, UpdateRequest, UserProfile},
    transport::serial::{SerialConfig, SerialTransport},
    DeviceRegistry, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let family = match args.next().as_deref() {
        Some("premium") => DeviceFamily::DaumPremium,
        Some("kettler") => DeviceFamily::Kettler,
        _ => DeviceFamily::DaumClassic,
    };
    let target_power = args.next().and_then(|raw| raw.parse().ok()).unwrap_or(120);

    info!("🚲 Ergolink Ride Monitor");
    info!("Opening {} on {}", family, path);

    let config = match family {
        DeviceFamily::DaumClassic => SerialConfig::daum_classic(&path),
        DeviceFamily::DaumPremium => SerialConfig::daum_premium(&path),
        DeviceFamily::Kettler => SerialConfig::kettler(&path),
    };
    let registry = DeviceRegistry::with_defaults();
    let bike = registry.build(
        family,
        Box::new(SerialTransport::new(config)),
        UserProfile::default(),
    )?;

    if let Err(e) = bike.start().await {
        error!("❌ Failed to start {}: {}", bike.name(), e);
        bike.link().force_close().await;
        return Err(e);
    }
    info!("✅ {} ready, holding {} W", bike.name(), target_power);

    let mut ticker = interval(Duration::from_secs(1));
    let started = Instant::now();
    let mut failures = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping...");
                break;
            }
            _ = ticker.tick() => {}
        }

        let update = UpdateRequest {
            target_power: Some(target_power),
            ..UpdateRequest::default()
        };
        match bike.send_update(update).await {
            Ok(data) => {
                failures = 0;
                let elapsed = started.elapsed().as_secs();
                println!(
                    "{:02}:{:02}  {:4} W  {:3} rpm  {:5.1} km/h  {:>3} bpm  {:6} m",
                    elapsed / 60,
                    elapsed % 60,
                    data.power,
                    data.cadence,
                    data.speed_kmh,
                    data.heart_rate.map_or_else(|| "-".to_string(), |hr| hr.to_string()),
                    data.distance_m,
                );
            }
            Err(e) if e.is_recoverable() => {
                failures += 1;
                warn!("⚠️  Update failed ({} in a row): {}", failures, e);
                if failures >= 5 {
                    error!("❌ Giving up");
                    break;
                }
            }
            Err(e) => {
                error!("❌ {}", e);
                break;
            }
        }
    }

    info!("🔌 Disconnecting...");
    if let Err(e) = bike.stop().await {
        error!("❌ Failed to stop cleanly: {}", e);
    }
    Ok(())
}
