//! Operations served by the demo host.

use serde_json::Value;
use std::time::Duration;
use tandem_rpc::{
    BodyReader, CancellationSignal, ErrorChain, JsonCodec, OutboundBody, RegistryError,
    ServiceRegistry,
};

/// Largest body `download` will produce.
const MAX_DOWNLOAD: u64 = 256 * 1024 * 1024;

/// Builds the registry shared by every connection.
pub fn registry() -> Result<ServiceRegistry, RegistryError> {
    let mut registry = ServiceRegistry::new(JsonCodec);
    registry
        .unary("echo", |(value,): (Value,), _cancel| async move {
            Ok::<_, ErrorChain>(value)
        })?
        .unary("sum", |values: Vec<i64>, _cancel| async move { sum(&values) })?
        .unary("sleep", |ms: u64, cancel| sleep(ms, cancel))?
        .download("download", |len: u64, _cancel| async move { download(len) })?
        .upload("upload", |(): (), body: BodyReader, _cancel| upload(body))?
        .one_way("log", |line: String| async move {
            tracing::info!("Peer says: {}", line);
        })?;
    Ok(registry)
}

fn sum(values: &[i64]) -> Result<i64, ErrorChain> {
    values.iter().try_fold(0i64, |total, v| {
        total
            .checked_add(*v)
            .ok_or_else(|| ErrorChain::new("Overflow", "sum does not fit in 64 bits"))
    })
}

async fn sleep(ms: u64, cancel: CancellationSignal) -> Result<u64, ErrorChain> {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(ms),
        _ = cancel.cancelled() => Err(ErrorChain::new("Canceled", "sleep was canceled")),
    }
}

/// A body of `len` bytes cycling through 0..=250.
fn download(len: u64) -> Result<OutboundBody, ErrorChain> {
    if len > MAX_DOWNLOAD {
        return Err(ErrorChain::new(
            "TooLarge",
            format!("download of {len} bytes exceeds {MAX_DOWNLOAD}"),
        ));
    }
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    Ok(OutboundBody::from_bytes(data))
}

/// Drains the body and reports how many bytes arrived.
async fn upload(mut body: BodyReader) -> Result<u64, std::io::Error> {
    tokio::io::copy(&mut body, &mut tokio::io::sink()).await
}
