//! Core BLE library for heartlink ECG sensors.
//!
//! This crate talks to a wearable ECG sensor over Bluetooth Low Energy and
//! turns its notifications into decoded packets for the rest of the
//! pipeline.
//!
//! # Features
//!
//! - **Radio abstraction**: [`RadioStack`] with a btleplug implementation
//!   ([`ble::BleRadio`]) and an in-memory one for tests ([`MockRadio`])
//! - **Device sessions**: connect, disconnect, subscribe and one-shot reads
//!   driven by a single event dispatcher ([`DeviceSession`])
//! - **Fanout**: independent chart, accumulator and sink consumers of the
//!   ECG stream ([`StreamFanout`])
//!
//! # Platform Differences
//!
//! - **macOS**: devices are identified by a UUID assigned by CoreBluetooth.
//!   It is stable for a given device on a given Mac but differs between Macs.
//! - **Linux/Windows**: devices are identified by their Bluetooth MAC address
//!   (e.g., `AA:BB:CC:DD:EE:FF`).
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use heartlink_core::{DeviceSession, SessionConfig};
//! use heartlink_core::ble::{BleRadio, GattProfile};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (radio, events) = BleRadio::new(GattProfile::default()).await?;
//!     let session = DeviceSession::new(Arc::new(radio), events, SessionConfig::default())?;
//!
//!     let mut scan = session.scan().await?;
//!     let found = scan.next().await.ok_or("no device found")?;
//!     session.stop_scan().await?;
//!
//!     session.connect(&found.device).await?;
//!     session.subscribe_ecg(&found.device, 128).await?;
//!
//!     let mut packets = session.ecg_stream();
//!     while let Some(packet) = packets.next().await {
//!         println!("#{}: {:?}", packet.sequence, packet.samples);
//!     }
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod clock;
pub mod error;
pub mod events;
pub mod fanout;
pub mod mock;
pub mod session;
pub mod traits;
pub mod util;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConnectionFailureReason, Error, Result};
pub use events::{
    ApiEvent, DeviceEvent, DeviceId, DiscoveredDevice, OperationEvent, RadioEvent,
    RadioEventReceiver, RadioEventSender, Resource, ResourceValue, StreamKind, Subscription,
    radio_channel,
};
pub use fanout::{
    Accumulator, AccumulatorConsumer, ChartBuffer, ChartConsumer, ChartOptions, ConsumerHandle,
    SampleSink, StreamFanout,
};
pub use mock::{MockRadio, MockRadioBuilder};
pub use session::{ConnectedDevice, DeviceSession, LinkStatus, SessionConfig, SessionState};
pub use traits::RadioStack;

// Re-export the types crate so downstream users need only one dependency.
pub use heartlink_types as types;
pub use heartlink_types::{DeviceInfo, EcgPacket, HeartRateReading, SampleRecord};
