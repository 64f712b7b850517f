//! Daum 8i Premium command set.
//!
//! Requests are a three character opcode followed by binary arguments; the
//! framing (escaping, checksum, ACK/NAK) is handled by the premium codec, so
//! replies seen here are the unescaped bytes after the echoed opcode.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{body_of_len, with_retry, Device, DeviceData, DeviceFamily, UpdateRequest, UserProfile};
use crate::{
    command::{Command, Response},
    error::{LinkError, Result},
    link::DeviceLink,
    types::RetryPolicy,
};

/// Highest gear
pub const MAX_GEAR: u8 = 28;
/// Highest target power, in watts
pub const MAX_POWER: u16 = 800;
/// Slope range accepted by the cockpit, in percent
pub const SLOPE_RANGE: std::ops::RangeInclusive<f64> = -20.0..=20.0;

const SLOPE_OFFSET: i32 = 200;
const WEIGHT_SCALE: f64 = 20.0;

fn opcode_command(label: &str, opcode: &[u8; 3], args: &[u8]) -> Command {
    let mut payload = opcode.to_vec();
    payload.extend_from_slice(args);
    Command::binary(label, payload)
}

/// `V00`: protocol version string
#[must_use]
pub fn get_protocol_version() -> Command {
    opcode_command("getProtocolVersion", b"V00", &[])
}

/// `V70`: dashboard firmware version string
#[must_use]
pub fn get_dashboard_version() -> Command {
    opcode_command("getDashboardVersion", b"V70", &[])
}

/// Parse a version reply (`V00`, `V70`)
///
/// # Errors
///
/// Returns [`LinkError::Parse`] if the reply is not text.
pub fn parse_version(response: &Response) -> Result<String> {
    Ok(response.as_text()?.trim().to_string())
}

/// Device kind reported by `Y00`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PremiumDeviceType {
    /// Ergometer
    Bike,
    /// Treadmill
    Run,
    /// Code not in the table
    Unknown(u8),
}

/// `Y00`: device kind
#[must_use]
pub fn get_device_type() -> Command {
    opcode_command("getDeviceType", b"Y00", &[])
}

/// Parse a `Y00` reply
///
/// # Errors
///
/// Returns [`LinkError::Parse`] on a wrong reply length.
pub fn parse_device_type(response: &Response) -> Result<PremiumDeviceType> {
    Ok(match body_of_len(response, 1)?[0] {
        0 => PremiumDeviceType::Bike,
        1 => PremiumDeviceType::Run,
        other => PremiumDeviceType::Unknown(other),
    })
}

/// Frame geometry selected on the cockpit (`M72`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BikeType {
    /// Race bike
    Race,
    /// Mountain bike
    Mountain,
    /// Triathlon bike
    Triathlon,
}

impl BikeType {
    const fn code(self) -> u8 {
        match self {
            Self::Race => 0,
            Self::Mountain => 1,
            Self::Triathlon => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Race),
            1 => Ok(Self::Mountain),
            2 => Ok(Self::Triathlon),
            other => Err(LinkError::Parse(format!("unknown bike type {other}"))),
        }
    }
}

/// `M72`: read the bike type
#[must_use]
pub fn get_bike_type() -> Command {
    opcode_command("getBikeType", b"M72", &[])
}

/// `M72`: select the bike type
#[must_use]
pub fn set_bike_type(bike_type: BikeType) -> Command {
    opcode_command("setBikeType", b"M72", &[bike_type.code()])
}

/// Parse an `M72` reply
///
/// # Errors
///
/// Returns [`LinkError::Parse`] for a wrong length or an unknown code.
pub fn parse_bike_type(response: &Response) -> Result<BikeType> {
    BikeType::from_code(body_of_len(response, 1)?[0])
}

/// `M71`: read the gear
#[must_use]
pub fn get_gear() -> Command {
    opcode_command("getGear", b"M71", &[])
}

/// `M71`: set the gear
///
/// # Errors
///
/// Returns [`LinkError::InvalidParameters`] for gears outside 1..=28.
pub fn set_gear(gear: u8) -> Result<Command> {
    if !(1..=MAX_GEAR).contains(&gear) {
        return Err(LinkError::InvalidParameters(format!(
            "gear {gear} outside 1..={MAX_GEAR}"
        )));
    }
    Ok(opcode_command("setGear", b"M71", &[gear]))
}

/// Parse an `M71` reply into the gear
///
/// # Errors
///
/// Returns [`LinkError::Parse`] on a wrong reply length.
pub fn parse_gear(response: &Response) -> Result<u8> {
    Ok(body_of_len(response, 1)?[0])
}

/// `S23`: target power in watts, clamped to the cockpit maximum
#[must_use]
pub fn set_power(watts: u16) -> Command {
    opcode_command("setPower", b"S23", &watts.min(MAX_POWER).to_le_bytes())
}

/// Parse an `S23` reply into watts
///
/// # Errors
///
/// Returns [`LinkError::Parse`] on a wrong reply length.
pub fn parse_power(response: &Response) -> Result<u16> {
    let body = body_of_len(response, 2)?;
    Ok(u16::from_le_bytes([body[0], body[1]]))
}

/// `S22`: slope in percent, sent as hundredths with a +200 offset
///
/// # Errors
///
/// Returns [`LinkError::InvalidParameters`] for slopes outside ±20 %.
pub fn set_slope(slope: f64) -> Result<Command> {
    if !SLOPE_RANGE.contains(&slope) {
        return Err(LinkError::InvalidParameters(format!(
            "slope {slope} outside {SLOPE_RANGE:?}"
        )));
    }
    // within ±2000 after scaling
    let raw = (slope * 100.0).round() as i32 + SLOPE_OFFSET;
    Ok(opcode_command("setSlope", b"S22", &raw.to_le_bytes()))
}

/// Parse an `S22` reply into percent
///
/// # Errors
///
/// Returns [`LinkError::Parse`] on a wrong reply length.
pub fn parse_slope(response: &Response) -> Result<f64> {
    let body = body_of_len(response, 4)?;
    let raw = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    Ok(f64::from(raw - SLOPE_OFFSET) / 100.0)
}

const PERSON_RECORD_LEN: usize = 13;
const POWER_LIMIT_INDEX: usize = 8;
const POWER_LIMIT: u8 = 80;

/// `M70`: upload rider data
#[must_use]
pub fn set_person(profile: &UserProfile) -> Command {
    // whole twentieths of a kilogram, at most 5000
    let weight = (profile.weight_kg.clamp(10.0, 250.0) * WEIGHT_SCALE).round() as u16;
    let [weight_lo, weight_hi] = weight.to_le_bytes();
    let record: [u8; PERSON_RECORD_LEN] = [
        profile.age.clamp(10, 99),
        u8::from(!profile.male),
        u8::try_from(profile.height_cm.clamp(100, 220)).unwrap_or(u8::MAX),
        weight_lo,
        weight_hi,
        // body fat, coaching level, coaching frequency
        0,
        0,
        3,
        POWER_LIMIT,
        // heart rate, time, distance and energy limits
        0,
        0,
        0,
        0,
    ];
    opcode_command("setPerson", b"M70", &record)
}

/// Check that an `M70` reply echoes the uploaded record
///
/// Some dashboards answer the power limit field with 0 instead of echoing
/// it; either value is accepted for that field only.
///
/// # Errors
///
/// Returns [`LinkError::Parse`] if any other field differs.
pub fn check_person(request: &Command, response: &Response) -> Result<()> {
    let body = body_of_len(response, PERSON_RECORD_LEN)?;
    let sent = request.payload().as_bytes().get(3..).unwrap_or_default();
    for (i, (&got, &want)) in body.iter().zip(sent).enumerate() {
        let accepted = if i == POWER_LIMIT_INDEX {
            got == 0 || got == POWER_LIMIT
        } else {
            got == want
        };
        if !accepted {
            return Err(LinkError::Parse(format!(
                "person record field {i}: sent {want}, got {got}"
            )));
        }
    }
    Ok(())
}

/// Live values from `X70`
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingData {
    /// Elapsed time in seconds
    pub time_s: u32,
    /// Heart rate in bpm, 0 without sensor
    pub heart_rate: u8,
    /// Speed in km/h
    pub speed_kmh: f64,
    /// Slope in percent
    pub slope: f64,
    /// Distance in metres
    pub distance_m: u32,
    /// Cadence in rpm
    pub cadence: u8,
    /// Power in watts
    pub power: u16,
    /// Gear
    pub gear: u8,
}

const TRAINING_DATA_LEN: usize = 17;

/// `X70`: live training values
#[must_use]
pub fn get_training_data() -> Command {
    opcode_command("getTrainingData", b"X70", &[])
}

/// Parse an `X70` reply
///
/// # Errors
///
/// Returns [`LinkError::Parse`] on a wrong reply length.
pub fn parse_training_data(response: &Response) -> Result<TrainingData> {
    let b = body_of_len(response, TRAINING_DATA_LEN)?;
    Ok(TrainingData {
        time_s: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        heart_rate: b[4],
        speed_kmh: f64::from(u16::from_le_bytes([b[5], b[6]])) / 10.0,
        slope: f64::from(i16::from_le_bytes([b[7], b[8]])) / 10.0,
        distance_m: u32::from_le_bytes([b[9], b[10], b[11], b[12]]),
        cadence: b[13],
        power: u16::from_le_bytes([b[14], b[15]]),
        gear: b[16],
    })
}

/// A Daum 8i cockpit
pub struct DaumPremiumDevice {
    name: String,
    link: DeviceLink,
    profile: UserProfile,
    retry: RetryPolicy,
}

impl DaumPremiumDevice {
    /// Drive the cockpit over `link`
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
impl Device for DaumPremiumDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> DeviceFamily {
        DeviceFamily::DaumPremium
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
        let protocol = parse_version(&self.exchange(get_protocol_version()).await?)?;
        let dashboard = parse_version(&self.exchange(get_dashboard_version()).await?)?;
        let kind = parse_device_type(&self.exchange(get_device_type()).await?)?;
        info!(
            "{}: {:?} dashboard {} (protocol {})",
            self.name, kind, dashboard, protocol
        );

        let person = set_person(&self.profile);
        let reply = self.exchange(person.clone()).await?;
        check_person(&person, &reply)?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.link.close().await
    }

    async fn send_update(&self, request: UpdateRequest) -> Result<DeviceData> {
        if let Some(watts) = request.target_power {
            let power = parse_power(&self.exchange(set_power(watts)).await?)?;
            debug!("{}: power set to {}W", self.name, power);
        }
        if let Some(slope) = request.slope {
            self.exchange(set_slope(slope)?).await?;
        }
        if let Some(gear) = request.gear {
            let gear = parse_gear(&self.exchange(set_gear(gear)?).await?)?;
            debug!("{}: gear {}", self.name, gear);
        }

        let data = parse_training_data(&self.exchange(get_training_data()).await?)?;
        Ok(DeviceData {
            power: data.power,
            cadence: u16::from(data.cadence),
            speed_kmh: data.speed_kmh,
            heart_rate: (data.heart_rate > 0).then_some(data.heart_rate),
            distance_m: data.distance_m,
            time_s: data.time_s,
            gear: Some(data.gear),
            pedalling: data.cadence > 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{premium, DecodeResult, EscapedFrameCodec, FrameCodec};
    use bytes::Bytes;

    fn reply(command: &Command, body: &[u8]) -> Response {
        Response::new(command.id(), Bytes::copy_from_slice(body))
    }

    /// Encode `command`, answer it with the opcode echo and `body`, decode
    fn exchange_via_codec(command: &Command, body: &[u8]) -> Response {
        let mut codec = EscapedFrameCodec::new();
        codec.encode(command).unwrap();
        let opcode = &command.payload().as_bytes()[..3];
        let mut wire = vec![premium::ACK];
        wire.extend_from_slice(&premium::encode_frame(opcode, body));
        match codec.feed(&wire) {
            DecodeResult::Response(body) => Response::new(command.id(), body),
            other => panic!("unexpected decode result {other:?}"),
        }
    }

    #[test]
    fn test_set_gear_round_trip() {
        let command = set_gear(10).unwrap();
        assert_eq!(command.payload().as_bytes(), b"M71\x0a");
        assert_eq!(parse_gear(&exchange_via_codec(&command, &[10])).unwrap(), 10);
    }

    #[test]
    fn test_reserved_gears_survive_escaping() {
        for gear in [0x01, 0x06, 0x12, 0x15, 0x17] {
            let command = set_gear(gear).unwrap();
            assert_eq!(
                parse_gear(&exchange_via_codec(&command, &[gear])).unwrap(),
                gear
            );
        }
        assert!(set_gear(29).is_err());
    }

    #[test]
    fn test_power_little_endian() {
        let command = set_power(300);
        assert_eq!(&command.payload().as_bytes()[3..], &[0x2C, 0x01]);
        assert_eq!(parse_power(&reply(&command, &[0x2C, 0x01])).unwrap(), 300);
        assert_eq!(&set_power(1_000).payload().as_bytes()[3..], &800u16.to_le_bytes());
    }

    #[test]
    fn test_slope_fixed_point() {
        let command = set_slope(-1.5).unwrap();
        assert_eq!(&command.payload().as_bytes()[3..], &50i32.to_le_bytes());
        let slope = parse_slope(&reply(&command, &50i32.to_le_bytes())).unwrap();
        assert!((slope + 1.5).abs() < 1e-9);
        assert!(set_slope(25.0).is_err());
    }

    #[test]
    fn test_person_weight_scaled() {
        let command = set_person(&UserProfile::default());
        let record = &command.payload().as_bytes()[3..];
        assert_eq!(record.len(), 13);
        assert_eq!(u16::from_le_bytes([record[3], record[4]]), 1_500);
    }

    #[test]
    fn test_person_power_limit_quirk() {
        let command = set_person(&UserProfile::default());
        let mut echo = command.payload().as_bytes()[3..].to_vec();
        assert!(check_person(&command, &reply(&command, &echo)).is_ok());

        echo[8] = 0;
        assert!(check_person(&command, &reply(&command, &echo)).is_ok());

        echo[8] = 40;
        assert!(check_person(&command, &reply(&command, &echo)).is_err());

        echo[8] = 80;
        echo[0] = 31;
        assert!(check_person(&command, &reply(&command, &echo)).is_err());
    }

    #[test]
    fn test_version_through_codec() {
        let command = get_protocol_version();
        let version = parse_version(&exchange_via_codec(&command, b"1.00")).unwrap();
        assert_eq!(version, "1.00");
    }

    #[test]
    fn test_training_data() {
        let mut body = Vec::new();
        body.extend_from_slice(&125u32.to_le_bytes());
        body.push(140);
        body.extend_from_slice(&325u16.to_le_bytes());
        body.extend_from_slice(&(-15i16).to_le_bytes());
        body.extend_from_slice(&2_500u32.to_le_bytes());
        body.push(88);
        body.extend_from_slice(&210u16.to_le_bytes());
        body.push(14);

        let command = get_training_data();
        let data = parse_training_data(&reply(&command, &body)).unwrap();
        assert_eq!(data.time_s, 125);
        assert_eq!(data.heart_rate, 140);
        assert!((data.speed_kmh - 32.5).abs() < 1e-9);
        assert!((data.slope + 1.5).abs() < 1e-9);
        assert_eq!(data.distance_m, 2_500);
        assert_eq!(data.cadence, 88);
        assert_eq!(data.power, 210);
        assert_eq!(data.gear, 14);
    }

    #[test]
    fn test_bike_type() {
        let command = set_bike_type(BikeType::Mountain);
        assert_eq!(command.payload().as_bytes(), b"M72\x01");
        assert_eq!(
            parse_bike_type(&reply(&command, &[2])).unwrap(),
            BikeType::Triathlon
        );
        assert!(parse_bike_type(&reply(&command, &[9])).is_err());
    }
}
