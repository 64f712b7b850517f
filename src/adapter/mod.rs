//! Device adapters built on a [`DeviceLink`].
//!
//! Each family module holds the command vocabulary (builders producing
//! [`Command`](crate::Command)s and parsers for their replies) plus a device
//! type that owns one link and implements [`Device`]. Retry policy lives here,
//! never in the link.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, time::Duration};
use tracing::{error, warn};

use crate::{
    codec::CodecKind,
    command::Response,
    error::{LinkError, Result},
    link::DeviceLink,
    types::{LinkConfig, RetryPolicy},
};

pub mod daum_classic;
pub mod daum_premium;
pub mod kettler;

pub use daum_classic::DaumClassicDevice;
pub use daum_premium::DaumPremiumDevice;
pub use kettler::KettlerDevice;

/// Supported trainer families
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceFamily {
    /// Daum 8008 series with the classic binary protocol
    DaumClassic,
    /// Daum 8i series with the framed premium protocol
    DaumPremium,
    /// Kettler ergometers with the ASCII line protocol
    Kettler,
}

impl DeviceFamily {
    /// Every family, in registration order
    pub const ALL: [Self; 3] = [Self::DaumClassic, Self::DaumPremium, Self::Kettler];

    /// Wire framing spoken by this family
    #[must_use]
    pub const fn codec_kind(self) -> CodecKind {
        match self {
            Self::DaumClassic => CodecKind::Classic,
            Self::DaumPremium => CodecKind::Premium,
            Self::Kettler => CodecKind::Kettler,
        }
    }

    /// Link timeouts tuned for this family
    #[must_use]
    pub const fn link_config(self) -> LinkConfig {
        match self {
            Self::DaumClassic => LinkConfig::daum_classic(),
            Self::DaumPremium => LinkConfig::daum_premium(),
            Self::Kettler => LinkConfig::kettler(),
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DaumClassic => write!(f, "Daum Classic"),
            Self::DaumPremium => write!(f, "Daum Premium"),
            Self::Kettler => write!(f, "Kettler"),
        }
    }
}

/// Rider data sent to the cockpit on start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    /// Body weight in kilograms
    pub weight_kg: f64,
    /// Age in years
    pub age: u8,
    /// Male rider
    pub male: bool,
    /// Height in centimetres
    pub height_cm: u16,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            weight_kg: 75.0,
            age: 30,
            male: true,
            height_cm: 180,
        }
    }
}

/// Targets for one update cycle; `None` leaves a setting unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Target power in watts (ERG mode)
    pub target_power: Option<u16>,
    /// Simulated slope in percent
    pub slope: Option<f64>,
    /// Gear
    pub gear: Option<u8>,
}

/// Live values reported by a trainer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceData {
    /// Power in watts
    pub power: u16,
    /// Pedal cadence in rpm
    pub cadence: u16,
    /// Speed in km/h
    pub speed_kmh: f64,
    /// Heart rate in bpm, if a sensor is attached
    pub heart_rate: Option<u8>,
    /// Distance in metres
    pub distance_m: u32,
    /// Elapsed time in seconds
    pub time_s: u32,
    /// Current gear, if the device has gears
    pub gear: Option<u8>,
    /// Whether the rider is pedalling
    pub pedalling: bool,
}

/// A trainer driven over one [`DeviceLink`]
#[async_trait]
pub trait Device: Send + Sync {
    /// Display name
    fn name(&self) -> &str;

    /// Protocol family
    fn family(&self) -> DeviceFamily;

    /// Whether the device is a bike
    fn is_bike(&self) -> bool {
        true
    }

    /// Whether the device reports power
    fn is_power(&self) -> bool {
        true
    }

    /// Whether the device reports heart rate
    fn is_hrm(&self) -> bool;

    /// Rider weight used for simulation, in kilograms
    fn weight_kg(&self) -> f64;

    /// Underlying link
    fn link(&self) -> &DeviceLink;

    /// Connect and bring the cockpit into remote-control mode
    async fn start(&self) -> Result<()>;

    /// Leave remote-control mode and close the link
    async fn stop(&self) -> Result<()>;

    /// Apply targets and read back live data
    async fn send_update(&self, request: UpdateRequest) -> Result<DeviceData>;
}

/// Run `op` until it succeeds, fails with a non-recoverable error or
/// `policy.max_attempts` is exhausted, sleeping `policy.delay_ms` in between
///
/// # Errors
///
/// Returns the error of the last attempt.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && e.is_recoverable() => {
                warn!(
                    "{} failed on attempt {}/{}, retrying in {}ms: {}",
                    label, attempt, attempts, policy.delay_ms, e
                );
                tokio::time::sleep(Duration::from_millis(policy.delay_ms)).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    error!("{} failed after {} attempts: {}", label, attempt, e);
                }
                return Err(e);
            }
        }
    }
}

/// Reply body, checked for an exact length
pub(crate) fn body_of_len(response: &Response, len: usize) -> Result<&[u8]> {
    let body = response.body();
    if body.len() == len {
        Ok(body)
    } else {
        Err(LinkError::Parse(format!(
            "expected {len} byte reply, got {}",
            body.len()
        )))
    }
}
