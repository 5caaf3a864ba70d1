//! BACnet Raw Read Example
//!
//! Sends one confirmed request with a hex encoded payload and prints the answer.
//! Pairs with the `responder` example:
//!
//! ```text
//! cargo run --example read_raw -- 192.168.1.20:47808 12 0bb8
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bacnet_tsm::app::{ApplicationConfig, ApplicationLayer};
use bacnet_tsm::service::{ConfirmedServiceChoice, RawConfirmedRequest};
use bacnet_tsm::transport::{Address, BipConfig, BipTransport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <peer ip:port> <service choice> [payload hex]", args[0]);
        std::process::exit(1);
    }
    let peer: SocketAddr = args[1].parse()?;
    let service = ConfirmedServiceChoice::try_from(args[2].parse::<u8>()?)?;
    let payload = match args.get(3) {
        Some(text) => hex::decode(text)?,
        None => Vec::new(),
    };

    let transport = Arc::new(BipTransport::bind(BipConfig {
        bind_address: "0.0.0.0:0".parse()?,
        ..Default::default()
    })?);
    let app = ApplicationLayer::new(transport, ApplicationConfig::default());
    let receiver = app.clone();
    tokio::spawn(async move { receiver.run().await });

    let started = Instant::now();
    let request = RawConfirmedRequest::new(service, payload);
    match app.request(&Address::ip(peer), &request).await {
        Ok(ack) => {
            let payload = ack.payload();
            println!(
                "{:?} answered in {:?}: {} bytes",
                service,
                started.elapsed(),
                payload.len()
            );
            if !payload.is_empty() {
                println!("{}", hex::encode(&payload[..payload.len().min(64)]));
            }
        }
        Err(e) => println!("{:?} failed after {:?}: {}", service, started.elapsed(), e),
    }

    let stats = app.statistics();
    println!(
        "sent {} APDUs, received {}, {} retries, {} segments",
        stats.apdus_sent, stats.apdus_received, stats.retries, stats.segments_received
    );
    Ok(())
}
