#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Ergolink
//!
//! Transactional serial/TCP links to indoor-cycling trainers.
//!
//! A [`DeviceLink`] turns a raw byte stream into reliable command/response
//! transactions. It speaks three wire framings:
//!
//! - **Classic** (Daum 8008): fixed-length binary replies that echo the
//!   request opcode
//! - **Premium** (Daum 8i): escaped `SOH … ETB` frames with a decimal checksum
//!   and an ACK/NAK handshake
//! - **Kettler**: CRLF terminated ASCII lines with tab separated fields
//!
//! Whatever the framing, a link keeps at most one transaction outstanding,
//! dispatches concurrent `send()` calls in call order, applies per-command
//! timeouts and cancels everything pending when it closes. It never retries;
//! the adapters in [`adapter`] wrap commands in their own [`RetryPolicy`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use ergolink::{
//!     adapter::daum_classic,
//!     transport::serial::{SerialConfig, SerialTransport},
//!     codec::CodecKind,
//!     DeviceLink, LinkConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = SerialTransport::new(SerialConfig::daum_classic("/dev/ttyUSB0"));
//!     let link = DeviceLink::with_codec_kind(
//!         "8008",
//!         transport,
//!         CodecKind::Classic,
//!         LinkConfig::daum_classic(),
//!     );
//!
//!     let reply = link.send(daum_classic::check_cockpit(0)).await?;
//!     let cockpit = daum_classic::parse_check_cockpit(&reply)?;
//!     println!("bike {} firmware {}", cockpit.bike, cockpit.version);
//!
//!     link.send(daum_classic::set_power(0, 150)).await?;
//!     link.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! Device-level control goes through [`adapter::Device`], built from a
//! [`DeviceRegistry`]:
//!
//! ```no_run
//! use ergolink::{
//!     adapter::{DeviceFamily, UpdateRequest, UserProfile},
//!     transport::tcp::{TcpConfig, TcpTransport},
//!     DeviceRegistry,
//! };
//!
//! # async fn demo() -> ergolink::Result<()> {
//! let registry = DeviceRegistry::with_defaults();
//! let transport = TcpTransport::new(TcpConfig::daum_premium("192.168.1.40"));
//! let bike = registry.build(
//!     DeviceFamily::DaumPremium,
//!     Box::new(transport),
//!     UserProfile::default(),
//! )?;
//! bike.start().await?;
//! let data = bike
//!     .send_update(UpdateRequest {
//!         target_power: Some(200),
//!         ..UpdateRequest::default()
//!     })
//!     .await?;
//! println!("{} W at {} rpm", data.power, data.cadence);
//! bike.stop().await?;
//! # Ok(())
//! # }
//! ```

/// Device families, command vocabularies and retry
pub mod adapter;
/// Wire framings
pub mod codec;
/// Commands and responses
pub mod command;
/// Connection lifecycle
pub mod connection;
/// Error types and handling
pub mod error;
/// The link facade
pub mod link;
/// Transaction serialization
pub mod queue;
/// Explicit device family registry
pub mod registry;
/// Physical transports
pub mod transport;
/// State and configuration types
pub mod types;

pub use codec::{CodecKind, DecodeResult, FrameCodec};
pub use command::{Command, CommandId, Payload, Response};
pub use error::{LinkError, ProtocolErrorKind, Result};
pub use link::DeviceLink;
pub use registry::DeviceRegistry;
pub use transport::{Transport, TransportEvent, TransportFault};
pub use types::{LinkConfig, LinkConnectionState, RetryPolicy, TransactionState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
