//! Shared helpers for heartlink-core.

use btleplug::platform::PeripheralId;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms, they may be
/// MAC addresses or other formats.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    strip_peripheral_wrapper(&format!("{:?}", id))
}

fn strip_peripheral_wrapper(debug: &str) -> String {
    debug
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Create an identifier string from an address and peripheral ID.
///
/// On macOS where addresses are 00:00:00:00:00:00, uses the peripheral ID.
/// On other platforms, uses the Bluetooth address.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if is_unset_address(address) {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_string()
    }
}

fn is_unset_address(address: &str) -> bool {
    address == "00:00:00:00:00:00"
}

/// Turn a broadcast receiver into a lossy stream.
///
/// Items the receiver lagged behind on are skipped. The stream ends when the
/// sender is dropped.
pub fn broadcast_stream<T>(receiver: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(item) => return Some((item, receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Stream consumer lagged, dropping items");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_peripheral_wrapper() {
        assert_eq!(
            strip_peripheral_wrapper("PeripheralId(AA:BB:CC:DD:EE:FF)"),
            "AA:BB:CC:DD:EE:FF"
        );
    }

    #[test]
    fn test_unset_address() {
        assert!(is_unset_address("00:00:00:00:00:00"));
        assert!(!is_unset_address("AA:BB:CC:DD:EE:FF"));
    }

    #[tokio::test]
    async fn test_broadcast_stream_skips_lagged() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = broadcast_stream(rx);
        for i in 0..5 {
            tx.send(i).unwrap();
        }
        drop(tx);

        let items: Vec<i32> = stream.by_ref().collect().await;
        assert_eq!(items, vec![3, 4]);
    }
}
