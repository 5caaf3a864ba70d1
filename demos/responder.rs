//! BACnet Responder Example
//!
//! Answers every ReadProperty request with a ComplexACK of the requested size, so
//! clients can exercise segmentation against a real UDP endpoint. The payload of the
//! request is read as a big endian u16 giving the number of bytes to return.
//!
//! ```text
//! RUST_LOG=debug cargo run --example responder -- 0.0.0.0:47808
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bacnet_tsm::app::{
    ApplicationConfig, ApplicationLayer, ConfirmedReply, ConfirmedServiceHandler,
    UnconfirmedServiceHandler,
};
use bacnet_tsm::service::{
    ConfirmedServiceChoice, DecodeFailure, ServiceError, UnconfirmedServiceChoice,
};
use bacnet_tsm::transport::{Address, BipConfig, BipTransport};
use bytes::Bytes;

struct SizedRead;

#[async_trait]
impl ConfirmedServiceHandler for SizedRead {
    type Request = usize;

    fn decode(&self, payload: &[u8]) -> Result<usize, DecodeFailure> {
        match payload {
            [] | [_] => Err(DecodeFailure::MissingRequiredParameter),
            [high, low] => Ok(u16::from_be_bytes([*high, *low]) as usize),
            _ => Err(DecodeFailure::TooManyArguments),
        }
    }

    async fn handle(&self, length: usize, reply: ConfirmedReply) -> Result<(), ServiceError> {
        log::info!(
            "Read of {} bytes from {} (invoke ID {}, accepts {:?} x {} bytes)",
            length,
            reply.source(),
            reply.invoke_id(),
            reply.max_segments(),
            reply.max_apdu()
        );
        let payload: Bytes = (0..length).map(|i| i as u8).collect();
        reply
            .complex_ack(payload)
            .await
            .map_err(|e| ServiceError::EncodingError(e.to_string()))
    }
}

struct WhoIsLogger;

#[async_trait]
impl UnconfirmedServiceHandler for WhoIsLogger {
    type Request = Bytes;

    fn decode(&self, payload: &[u8]) -> Result<Bytes, DecodeFailure> {
        Ok(Bytes::copy_from_slice(payload))
    }

    async fn handle(&self, source: Address, request: Bytes) -> Result<(), ServiceError> {
        log::info!("Who-Is from {} ({} parameter bytes)", source, request.len());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let bind_address: SocketAddr = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => "0.0.0.0:47808".parse()?,
    };

    let transport = Arc::new(BipTransport::bind(BipConfig {
        bind_address,
        ..Default::default()
    })?);
    let app = ApplicationLayer::new(transport, ApplicationConfig::default());
    app.register_confirmed(ConfirmedServiceChoice::ReadProperty, SizedRead);
    app.register_unconfirmed(UnconfirmedServiceChoice::WhoIs, WhoIsLogger);

    log::info!("Listening on {}, press Ctrl+C to stop", bind_address);
    tokio::select! {
        result = app.run() => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Stopping"),
    }

    log::info!("{:#?}", app.statistics());
    Ok(())
}
