//! Daum 8008 Classic command set.
//!
//! Every request starts with an opcode byte, most are followed by the bike
//! index (0..=9 on a daisy chain). Replies have a fixed length per opcode and
//! echo the opcode.

use async_trait::async_trait;
use std::fmt;
use tracing::{debug, info};

use super::{body_of_len, with_retry, Device, DeviceData, DeviceFamily, UpdateRequest, UserProfile};
use crate::{
    command::{Command, Response},
    error::{LinkError, Result},
    link::DeviceLink,
    types::RetryPolicy,
};

/// Probe a cockpit at a bike index
pub const CHECK_COCKPIT: u8 = 0x10;
/// Ask for the bike index of the attached cockpit
pub const GET_ADDRESS: u8 = 0x11;
/// Reset the cockpit
pub const RESET_DEVICE: u8 = 0x12;
/// Start the selected program
pub const START_PROG: u8 = 0x21;
/// Stop the running program
pub const STOP_PROG: u8 = 0x22;
/// Select a program
pub const SET_PROG: u8 = 0x23;
/// Upload rider data
pub const SET_PERSON: u8 = 0x24;
/// Read live training data
pub const RUN_DATA: u8 = 0x40;
/// Set target power
pub const SET_POWER: u8 = 0x51;
/// Set gear
pub const SET_GEAR: u8 = 0x53;
/// Set slope
pub const SET_SLOPE: u8 = 0x55;
/// Read serial number and cockpit type
pub const GET_VERSION: u8 = 0x73;

/// Lowest target power accepted by the cockpit, in watts
pub const MIN_POWER: u16 = 25;
/// Highest target power accepted by the cockpit, in watts
pub const MAX_POWER: u16 = 800;
/// Power resolution on the wire, in watts
pub const POWER_STEP: u16 = 5;
/// Highest gear
pub const MAX_GEAR: u8 = 28;

/// Cockpit model reported by [`get_version`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CockpitType {
    /// Cardio
    Cardio,
    /// Fitness
    Fitness,
    /// Vita De Luxe
    VitaDeLuxe,
    /// 8008
    Daum8008,
    /// 8008 TRS
    Daum8008Trs,
    /// 8080
    Daum8080,
    /// Therapie
    Therapie,
    /// 8008 TRS Pro
    Daum8008TrsPro,
    /// 8008 TRS3
    Daum8008Trs3,
    /// Code not in the table
    Unknown(u8),
}

impl CockpitType {
    /// Decode the cockpit byte of a version reply
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            10 => Self::Cardio,
            20 => Self::Fitness,
            30 => Self::VitaDeLuxe,
            40 => Self::Daum8008,
            0x2A => Self::Daum8008Trs,
            50 => Self::Daum8080,
            60 => Self::Therapie,
            100 => Self::Daum8008TrsPro,
            160 => Self::Daum8008Trs3,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for CockpitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cardio => write!(f, "Cardio"),
            Self::Fitness => write!(f, "Fitness"),
            Self::VitaDeLuxe => write!(f, "Vita De Luxe"),
            Self::Daum8008 => write!(f, "8008"),
            Self::Daum8008Trs => write!(f, "8008 TRS"),
            Self::Daum8080 => write!(f, "8080"),
            Self::Therapie => write!(f, "Therapie"),
            Self::Daum8008TrsPro => write!(f, "8008 TRS Pro"),
            Self::Daum8008Trs3 => write!(f, "8008 TRS3"),
            Self::Unknown(code) => write!(f, "unknown ({code})"),
        }
    }
}

/// Reply to [`check_cockpit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CockpitCheck {
    /// Bike index
    pub bike: u8,
    /// Firmware version
    pub version: u8,
}

/// Reply to [`get_version`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Bike index
    pub bike: u8,
    /// Serial number as hex
    pub serial_no: String,
    /// Cockpit model
    pub cockpit: CockpitType,
}

/// Reply to [`set_power`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerAck {
    /// Bike index
    pub bike: u8,
    /// Power the cockpit settled on, in watts
    pub power: u16,
}

/// Reply to [`run_data`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunData {
    /// Bike index
    pub bike: u8,
    /// Running program
    pub program: u8,
    /// Active person slot
    pub person: u8,
    /// Rider is pedalling
    pub pedalling: bool,
    /// Power in watts
    pub power: u16,
    /// Cadence in rpm
    pub cadence: u8,
    /// Speed in km/h
    pub speed_kmh: u8,
    /// Distance in metres
    pub distance_m: u32,
    /// Elapsed time in seconds
    pub time_s: u16,
    /// Energy in kJ
    pub energy_kj: u16,
    /// Heart rate in bpm, 0 without sensor
    pub heart_rate: u8,
    /// Gear
    pub gear: u8,
}

fn bike_command(label: &str, opcode: u8, bike: u8, reply_len: usize) -> Command {
    Command::binary(label, vec![opcode, bike]).expect_reply_length(reply_len)
}

/// `checkCockpit`: probe bike index `bike`
#[must_use]
pub fn check_cockpit(bike: u8) -> Command {
    bike_command("checkCockpit", CHECK_COCKPIT, bike, 3)
}

/// Parse a `checkCockpit` reply
///
/// # Errors
///
/// Returns [`LinkError::Parse`] on a wrong reply length.
pub fn parse_check_cockpit(response: &Response) -> Result<CockpitCheck> {
    let body = body_of_len(response, 3)?;
    Ok(CockpitCheck {
        bike: body[1],
        version: body[2],
    })
}

/// `getAddress`: ask which bike index answers
#[must_use]
pub fn get_address() -> Command {
    Command::binary("getAddress", vec![GET_ADDRESS]).expect_reply_length(2)
}

/// Parse a `getAddress` reply into the bike index
///
/// # Errors
///
/// Returns [`LinkError::Parse`] on a wrong reply length.
pub fn parse_address(response: &Response) -> Result<u8> {
    Ok(body_of_len(response, 2)?[1])
}

/// `getVersion`: serial number and cockpit model
#[must_use]
pub fn get_version(bike: u8) -> Command {
    bike_command("getVersion", GET_VERSION, bike, 11)
}

/// Parse a `getVersion` reply
///
/// # Errors
///
/// Returns [`LinkError::Parse`] on a wrong reply length.
pub fn parse_version(response: &Response) -> Result<VersionInfo> {
    let body = body_of_len(response, 11)?;
    Ok(VersionInfo {
        bike: body[1],
        serial_no: body[2..10].iter().map(|b| format!("{b:02X}")).collect(),
        cockpit: CockpitType::from_code(body[10]),
    })
}

/// `resetDevice`
#[must_use]
pub fn reset_device(bike: u8) -> Command {
    bike_command("resetDevice", RESET_DEVICE, bike, 2)
}

/// `startProg`
#[must_use]
pub fn start_prog(bike: u8) -> Command {
    bike_command("startProg", START_PROG, bike, 3)
}

/// `stopProg`
#[must_use]
pub fn stop_prog(bike: u8) -> Command {
    bike_command("stopProg", STOP_PROG, bike, 3)
}

/// `setProg`: select program `program` (0 is manual watt mode)
#[must_use]
pub fn set_prog(bike: u8, program: u8) -> Command {
    Command::binary("setProg", vec![SET_PROG, bike, program]).expect_reply_length(4)
}

/// Parse a `setProg` reply into the selected program
///
/// # Errors
///
/// Returns [`LinkError::Parse`] on a wrong reply length.
pub fn parse_prog(response: &Response) -> Result<u8> {
    Ok(body_of_len(response, 4)?[2])
}

/// Person slot used for uploads
const PERSON_SLOT: u8 = 0;
/// Record length of `setPerson` request and reply
const PERSON_RECORD_LEN: usize = 16;

/// `setPerson`: upload rider data to slot 0
#[must_use]
pub fn set_person(bike: u8, profile: &UserProfile) -> Command {
    let mut record = vec![0u8; PERSON_RECORD_LEN];
    record[0] = SET_PERSON;
    record[1] = bike;
    record[2] = PERSON_SLOT;
    record[3] = profile.age.clamp(10, 99);
    record[4] = u8::from(!profile.male);
    record[5] = u8::try_from(profile.height_cm.clamp(100, 220)).unwrap_or(u8::MAX);
    // whole kilograms
    record[6] = profile.weight_kg.round().clamp(10.0, 250.0) as u8;
    // body fat, coaching level, coaching frequency
    record[7] = 0;
    record[8] = 0;
    record[9] = 3;
    // power limit in 5 W steps
    record[10] = 80;
    Command::binary("setPerson", record).expect_reply_length(PERSON_RECORD_LEN)
}

/// Check that a `setPerson` reply echoes the uploaded record
///
/// # Errors
///
/// Returns [`LinkError::Parse`] if age, gender, height or weight differ.
pub fn check_person(request: &Command, response: &Response) -> Result<()> {
    let body = body_of_len(response, PERSON_RECORD_LEN)?;
    let sent = request.payload().as_bytes();
    if sent.len() >= 7 && body[3..7] != sent[3..7] {
        return Err(LinkError::Parse(format!(
            "person record not accepted: sent {:02X?}, got {:02X?}",
            &sent[3..7],
            &body[3..7]
        )));
    }
    Ok(())
}

/// `runData`: live training values
#[must_use]
pub fn run_data(bike: u8) -> Command {
    bike_command("runData", RUN_DATA, bike, 19)
}

/// Parse a `runData` reply
///
/// # Errors
///
/// Returns [`LinkError::Parse`] on a wrong reply length.
pub fn parse_run_data(response: &Response) -> Result<RunData> {
    let body = body_of_len(response, 19)?;
    Ok(RunData {
        bike: body[1],
        program: body[2],
        person: body[3],
        pedalling: body[4] != 0,
        power: u16::from(body[5]) * POWER_STEP,
        cadence: body[6],
        speed_kmh: body[7],
        distance_m: u32::from(u16::from_le_bytes([body[8], body[9]])) * 100,
        time_s: u16::from_le_bytes([body[10], body[11]]),
        energy_kj: u16::from_le_bytes([body[12], body[13]]),
        heart_rate: body[14],
        gear: body[16],
    })
}

/// `setGear`
///
/// # Errors
///
/// Returns [`LinkError::InvalidParameters`] for gears outside 1..=28.
pub fn set_gear(bike: u8, gear: u8) -> Result<Command> {
    if !(1..=MAX_GEAR).contains(&gear) {
        return Err(LinkError::InvalidParameters(format!(
            "gear {gear} outside 1..={MAX_GEAR}"
        )));
    }
    Ok(Command::binary("setGear", vec![SET_GEAR, bike, gear]).expect_reply_length(3))
}

/// Parse a `setGear` reply into the gear
///
/// # Errors
///
/// Returns [`LinkError::Parse`] on a wrong reply length.
pub fn parse_gear(response: &Response) -> Result<u8> {
    Ok(body_of_len(response, 3)?[2])
}

/// `setPower`: clamped to 25..=800 W and sent in 5 W steps
#[must_use]
pub fn set_power(bike: u8, watts: u16) -> Command {
    let steps = watts.clamp(MIN_POWER, MAX_POWER) / POWER_STEP;
    // at most 160
    Command::binary("setPower", vec![SET_POWER, bike, steps as u8]).expect_reply_length(3)
}

/// Parse a `setPower` reply
///
/// # Errors
///
/// Returns [`LinkError::Parse`] on a wrong reply length.
pub fn parse_power(response: &Response) -> Result<PowerAck> {
    let body = body_of_len(response, 3)?;
    Ok(PowerAck {
        bike: body[1],
        power: u16::from(body[2]) * POWER_STEP,
    })
}

/// `setSlope`: IEEE-754 single, little-endian bytes reversed
#[must_use]
pub fn set_slope(bike: u8, slope: f32) -> Command {
    let mut payload = vec![SET_SLOPE, bike];
    payload.extend_from_slice(&slope.to_be_bytes());
    Command::binary("setSlope", payload).expect_reply_length(6)
}

/// Parse a `setSlope` reply into the slope
///
/// # Errors
///
/// Returns [`LinkError::Parse`] on a wrong reply length.
pub fn parse_slope(response: &Response) -> Result<f32> {
    let body = body_of_len(response, 6)?;
    Ok(f32::from_be_bytes([body[2], body[3], body[4], body[5]]))
}

/// A Daum 8008 cockpit
pub struct DaumClassicDevice {
    name: String,
    link: DeviceLink,
    bike: u8,
    profile: UserProfile,
    retry: RetryPolicy,
}

impl DaumClassicDevice {
    /// Drive the cockpit at index `bike` over `link`
    pub fn new(name: impl Into<String>, link: DeviceLink, bike: u8, profile: UserProfile) -> Self {
        Self {
            name: name.into(),
            link,
            bike,
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

    /// Bike index
    #[must_use]
    pub const fn bike(&self) -> u8 {
        self.bike
    }

    async fn exchange(&self, command: Command) -> Result<Response> {
        let label = command.log_label().to_string();
        with_retry(&self.retry, &label, || self.link.send(command.clone())).await
    }
}

#[async_trait]
impl Device for DaumClassicDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> DeviceFamily {
        DeviceFamily::DaumClassic
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
        let check = parse_check_cockpit(&self.exchange(check_cockpit(self.bike)).await?)?;
        let version = parse_version(&self.exchange(get_version(check.bike)).await?)?;
        info!(
            "{}: cockpit {} (serial {}, firmware {})",
            self.name, version.cockpit, version.serial_no, check.version
        );

        let person = set_person(self.bike, &self.profile);
        let reply = self.exchange(person.clone()).await?;
        check_person(&person, &reply)?;

        let program = parse_prog(&self.exchange(set_prog(self.bike, 0)).await?)?;
        debug!("{}: program {} selected", self.name, program);
        self.exchange(start_prog(self.bike)).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let stopped = self.exchange(stop_prog(self.bike)).await;
        self.link.close().await?;
        stopped.map(|_| ())
    }

    async fn send_update(&self, request: UpdateRequest) -> Result<DeviceData> {
        if let Some(watts) = request.target_power {
            let ack = parse_power(&self.exchange(set_power(self.bike, watts)).await?)?;
            debug!("{}: power set to {}W", self.name, ack.power);
        }
        if let Some(slope) = request.slope {
            #[allow(clippy::cast_possible_truncation)]
            self.exchange(set_slope(self.bike, slope as f32)).await?;
        }
        if let Some(gear) = request.gear {
            self.exchange(set_gear(self.bike, gear)?).await?;
        }

        let data = parse_run_data(&self.exchange(run_data(self.bike)).await?)?;
        Ok(DeviceData {
            power: data.power,
            cadence: u16::from(data.cadence),
            speed_kmh: f64::from(data.speed_kmh),
            heart_rate: (data.heart_rate > 0).then_some(data.heart_rate),
            distance_m: data.distance_m,
            time_s: u32::from(data.time_s),
            gear: Some(data.gear),
            pedalling: data.pedalling,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn reply(command: &Command, body: &[u8]) -> Response {
        Response::new(command.id(), Bytes::copy_from_slice(body))
    }

    #[test]
    fn test_check_cockpit() {
        let command = check_cockpit(0);
        assert_eq!(command.payload().as_bytes(), &[0x10, 0x00]);
        assert_eq!(command.expected_reply_length(), Some(3));
        assert_eq!(
            parse_check_cockpit(&reply(&command, &[0x10, 0x00, 0x01])).unwrap(),
            CockpitCheck { bike: 0, version: 1 }
        );
    }

    #[test]
    fn test_set_power_round_trip() {
        let command = set_power(0, 250);
        assert_eq!(command.payload().as_bytes(), &[0x51, 0x00, 50]);
        assert_eq!(
            parse_power(&reply(&command, command.payload().as_bytes())).unwrap(),
            PowerAck { bike: 0, power: 250 }
        );
    }

    #[test]
    fn test_set_power_clamps() {
        assert_eq!(set_power(0, 5).payload().as_bytes()[2], 5);
        assert_eq!(set_power(0, 2_000).payload().as_bytes()[2], 160);
    }

    #[test]
    fn test_slope_bytes_reversed() {
        let command = set_slope(1, 2.5);
        let mut little = 2.5f32.to_le_bytes();
        little.reverse();
        assert_eq!(&command.payload().as_bytes()[2..], &little);

        let mut echo = command.payload().as_bytes().to_vec();
        echo.truncate(6);
        assert!((parse_slope(&reply(&command, &echo)).unwrap() - 2.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_version_reply() {
        let command = get_version(0);
        let body = [0x73, 0x00, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0, 0x2A];
        let version = parse_version(&reply(&command, &body)).unwrap();
        assert_eq!(version.serial_no, "123456789ABCDEF0");
        assert_eq!(version.cockpit, CockpitType::Daum8008Trs);
        assert_eq!(CockpitType::from_code(160).to_string(), "8008 TRS3");
    }

    #[test]
    fn test_run_data() {
        let command = run_data(0);
        let body = [
            0x40, 0x00, 0x00, 0x00, 0x01, 30, 90, 32, 0x0C, 0x00, 0x2C, 0x01, 0x40, 0x00, 128,
            0x00, 12, 0x00, 0x00,
        ];
        let data = parse_run_data(&reply(&command, &body)).unwrap();
        assert!(data.pedalling);
        assert_eq!(data.power, 150);
        assert_eq!(data.cadence, 90);
        assert_eq!(data.distance_m, 1_200);
        assert_eq!(data.time_s, 300);
        assert_eq!(data.energy_kj, 64);
        assert_eq!(data.heart_rate, 128);
        assert_eq!(data.gear, 12);
    }

    #[test]
    fn test_wrong_length_is_parse_error() {
        let command = run_data(0);
        assert!(matches!(
            parse_run_data(&reply(&command, &[0x40, 0x00])),
            Err(LinkError::Parse(_))
        ));
    }

    #[test]
    fn test_person_record() {
        let profile = UserProfile {
            weight_kg: 82.4,
            ..UserProfile::default()
        };
        let command = set_person(0, &profile);
        let sent = command.payload().as_bytes().to_vec();
        assert_eq!(sent.len(), 16);
        assert_eq!(&sent[3..7], &[30, 0, 180, 82]);
        assert!(check_person(&command, &reply(&command, &sent)).is_ok());

        let mut changed = sent;
        changed[6] = 70;
        assert!(check_person(&command, &reply(&command, &changed)).is_err());
    }

    #[test]
    fn test_gear_range() {
        assert!(set_gear(0, 0).is_err());
        assert!(set_gear(0, 29).is_err());
        assert_eq!(set_gear(0, 28).unwrap().payload().as_bytes(), &[0x53, 0x00, 28]);
    }
}
