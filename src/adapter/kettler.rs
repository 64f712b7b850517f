//! Kettler ergometer command set (ASCII lines).

use async_trait::async_trait;
use tracing::{debug, info};

use super::{with_retry, Device, DeviceData, DeviceFamily, UpdateRequest, UserProfile};
use crate::{
    command::{Command, Response},
    error::{LinkError, ProtocolErrorKind, Result},
    link::DeviceLink,
    types::RetryPolicy,
};

/// Fields in a status line
pub const STATUS_FIELDS: usize = 8;
/// Lowest target power, in watts
pub const MIN_POWER: u16 = 25;
/// Highest target power, in watts
pub const MAX_POWER: u16 = 400;
/// Power resolution, in watts
pub const POWER_STEP: u16 = 5;

/// `CM`: enter computer (remote control) mode
#[must_use]
pub fn set_computer_mode() -> Command {
    Command::text("setComputerMode", "CM")
}

/// `RS`: reset the console
#[must_use]
pub fn reset() -> Command {
    Command::text("reset", "RS")
}

/// Check a mode change reply (`ACK` or `RUN`)
///
/// # Errors
///
/// Returns [`LinkError::Protocol`] with
/// [`ProtocolErrorKind::IllegalResponse`] for anything else.
pub fn check_ack(response: &Response) -> Result<()> {
    match response.as_text()?.trim() {
        "ACK" | "RUN" => Ok(()),
        other => Err(LinkError::protocol(
            ProtocolErrorKind::IllegalResponse,
            format!("expected ACK or RUN, got {other:?}"),
        )),
    }
}

/// `ID`: console identifier
#[must_use]
pub fn get_identifier() -> Command {
    Command::text("getIdentifier", "ID")
}

/// `VE`: firmware version
#[must_use]
pub fn get_version() -> Command {
    Command::text("getVersion", "VE")
}

/// Parse an `ID` or `VE` reply
///
/// # Errors
///
/// Returns [`LinkError::Parse`] if the reply is not text.
pub fn parse_text(response: &Response) -> Result<String> {
    Ok(response.as_text()?.trim().to_string())
}

/// `ST`: read a status line
#[must_use]
pub fn get_status() -> Command {
    Command::text("getStatus", "ST").expect_fields(STATUS_FIELDS)
}

/// `PW`: set target power; the console answers with a status line
#[must_use]
pub fn set_power(watts: u16) -> Command {
    let watts = watts.clamp(MIN_POWER, MAX_POWER) / POWER_STEP * POWER_STEP;
    Command::text("setPower", format!("PW{watts}")).expect_fields(STATUS_FIELDS)
}

/// One status line
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    /// Heart rate in bpm, 0 without sensor
    pub heart_rate: u8,
    /// Cadence in rpm
    pub cadence: u16,
    /// Speed in km/h
    pub speed_kmh: f64,
    /// Distance in metres
    pub distance_m: u32,
    /// Power the console is asked to hold, in watts
    pub requested_power: u16,
    /// Energy in kJ
    pub energy_kj: u32,
    /// Elapsed time in seconds
    pub time_s: u32,
    /// Measured power in watts
    pub actual_power: u16,
}

fn field<T: std::str::FromStr>(fields: &[&str], index: usize, name: &str) -> Result<T> {
    fields
        .get(index)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| {
            LinkError::protocol(
                ProtocolErrorKind::MalformedFrame,
                format!("status field {name} ({index}) is not a number"),
            )
        })
}

fn elapsed(raw: &str) -> Option<u32> {
    let (minutes, seconds) = raw.split_once(':')?;
    let minutes: u32 = minutes.trim().parse().ok()?;
    let seconds: u32 = seconds.trim().parse().ok()?;
    (seconds < 60).then_some(minutes * 60 + seconds)
}

/// Parse an `ST` or `PW` reply
///
/// Fields: pulse, rpm, speed (0.1 km/h), distance (0.1 km), requested
/// power, energy (kJ), `mm:ss`, actual power.
///
/// # Errors
///
/// Returns [`LinkError::Protocol`] with [`ProtocolErrorKind::MalformedFrame`]
/// for a wrong field count or a field that does not parse.
pub fn parse_status(response: &Response) -> Result<Status> {
    let fields = response.fields()?;
    if fields.len() != STATUS_FIELDS {
        return Err(LinkError::protocol(
            ProtocolErrorKind::MalformedFrame,
            format!("expected {STATUS_FIELDS} fields, got {}", fields.len()),
        ));
    }
    let time_s = elapsed(fields[6]).ok_or_else(|| {
        LinkError::protocol(
            ProtocolErrorKind::MalformedFrame,
            format!("status time {:?} is not mm:ss", fields[6]),
        )
    })?;
    Ok(Status {
        heart_rate: field(&fields, 0, "pulse")?,
        cadence: field(&fields, 1, "rpm")?,
        speed_kmh: f64::from(field::<u16>(&fields, 2, "speed")?) / 10.0,
        distance_m: field::<u32>(&fields, 3, "distance")? * 100,
        requested_power: field(&fields, 4, "power")?,
        energy_kj: field(&fields, 5, "energy")?,
        time_s,
        actual_power: field(&fields, 7, "actual power")?,
    })
}

/// A Kettler ergometer
pub struct KettlerDevice {
    name: String,
    link: DeviceLink,
    profile: UserProfile,
    retry: RetryPolicy,
}

impl KettlerDevice {
    /// Drive the console over `link`
    pub fn new(name: impl Into<String>, link: DeviceLink, profile: UserProfile) -> Self {
        Self {
            name: name.into(),
            link,
            profile,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn exchange(&self, command: Command) -> Result<Response> {
        let label = command.log_label().to_string();
        with_retry(&self.retry, &label, || self.link.send(command.clone())).await
    }
}

#[async_trait]
impl Device for KettlerDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> DeviceFamily {
        DeviceFamily::Kettler
    }

    fn is_hrm(&self) -> bool {
        true
    }

    fn weight_kg(&self) -> f64 {
        self.profile.weight_kg
    }

    fn link(&self) -> &DeviceLink {
        &self.link
    }

    async fn start(&self) -> Result<()> {
        check_ack(&self.exchange(reset()).await?)?;
        check_ack(&self.exchange(set_computer_mode()).await?)?;
        let id = parse_text(&self.exchange(get_identifier()).await?)?;
        let version = parse_text(&self.exchange(get_version()).await?)?;
        info!("{}: console {} firmware {}", self.name, id, version);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let reset = self.exchange(reset()).await;
        self.link.close().await?;
        reset.map(|_| ())
    }

    async fn send_update(&self, request: UpdateRequest) -> Result<DeviceData> {
        if request.slope.is_some() || request.gear.is_some() {
            debug!("{}: slope and gear are not supported", self.name);
        }
        let command = request.target_power.map_or_else(get_status, set_power);
        let status = parse_status(&self.exchange(command).await?)?;
        Ok(DeviceData {
            power: status.actual_power,
            cadence: status.cadence,
            speed_kmh: status.speed_kmh,
            heart_rate: (status.heart_rate > 0).then_some(status.heart_rate),
            distance_m: status.distance_m,
            time_s: status.time_s,
            gear: None,
            pedalling: status.cadence > 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn reply(command: &Command, line: &str) -> Response {
        Response::new(command.id(), Bytes::copy_from_slice(line.as_bytes()))
    }

    #[test]
    fn test_status_parse() {
        let command = get_status();
        assert_eq!(command.expected_fields(), Some(8));
        let status = parse_status(&reply(&command, "072\t080\t253\t012\t150\t034\t05:12\t148")).unwrap();
        assert_eq!(status.heart_rate, 72);
        assert_eq!(status.cadence, 80);
        assert!((status.speed_kmh - 25.3).abs() < 1e-9);
        assert_eq!(status.distance_m, 1_200);
        assert_eq!(status.requested_power, 150);
        assert_eq!(status.energy_kj, 34);
        assert_eq!(status.time_s, 312);
        assert_eq!(status.actual_power, 148);
    }

    #[test]
    fn test_status_bad_field() {
        let command = get_status();
        let err = parse_status(&reply(&command, "072\tabc\t253\t012\t150\t034\t05:12\t148"))
            .unwrap_err();
        assert_eq!(err.protocol_kind(), Some(ProtocolErrorKind::MalformedFrame));

        let err = parse_status(&reply(&command, "072\t080\t253\t012\t150\t034\t0512\t148"))
            .unwrap_err();
        assert_eq!(err.protocol_kind(), Some(ProtocolErrorKind::MalformedFrame));

        let err = parse_status(&reply(&command, "072\t080\t253")).unwrap_err();
        assert_eq!(err.protocol_kind(), Some(ProtocolErrorKind::MalformedFrame));
    }

    #[test]
    fn test_set_power_steps() {
        assert_eq!(set_power(152).payload().as_bytes(), b"PW150");
        assert_eq!(set_power(5).payload().as_bytes(), b"PW25");
        assert_eq!(set_power(900).payload().as_bytes(), b"PW400");
    }

    #[test]
    fn test_ack() {
        let command = reset();
        assert!(check_ack(&reply(&command, "ACK")).is_ok());
        assert!(check_ack(&reply(&command, "RUN")).is_ok());
        assert_eq!(
            check_ack(&reply(&command, "ERROR")).unwrap_err().protocol_kind(),
            Some(ProtocolErrorKind::IllegalResponse)
        );
    }
}
