use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ErgolinkError, Result},
    types::MachineStatus,
};

/// Extended-format start flag (frame carries destination/source addresses)
pub const FLAG_EXTENDED_START: u8 = 0xF0;

/// Standard-format start flag
pub const FLAG_START: u8 = 0xF1;

/// End-of-frame flag; also the delimiter the transport reads up to
pub const FLAG_STOP: u8 = 0xF2;

/// Byte-stuffing escape flag
pub const FLAG_STUFF: u8 = 0xF3;

/// CSAFE unit codes carried alongside numeric response fields
///
/// Only the subset observed on elliptical/rower-class equipment is named
/// here. Codes are passed through the codec raw; conversion to the output
/// units happens in [`crate::metrics`].
pub mod unit {
    /// Miles
    pub const MILE: u8 = 0x01;
    /// Tenths of a mile
    pub const TENTH_MILE: u8 = 0x02;
    /// Hundredths of a mile
    pub const HUNDREDTH_MILE: u8 = 0x03;
    /// Feet
    pub const FEET: u8 = 0x05;
    /// Miles per hour
    pub const MILE_PER_HOUR: u8 = 0x10;
    /// Tenths of a mile per hour
    pub const TENTH_MILE_PER_HOUR: u8 = 0x11;
    /// Hundredths of a mile per hour
    pub const HUNDREDTH_MILE_PER_HOUR: u8 = 0x12;
    /// Feet per minute
    pub const FEET_PER_MINUTE: u8 = 0x13;
    /// Kilometres
    pub const KILOMETER: u8 = 0x21;
    /// Tenths of a kilometre
    pub const TENTH_KILOMETER: u8 = 0x22;
    /// Hundredths of a kilometre
    pub const HUNDREDTH_KILOMETER: u8 = 0x23;
    /// Metres
    pub const METER: u8 = 0x24;
    /// Tenths of a metre
    pub const TENTH_METER: u8 = 0x25;
    /// Centimetres
    pub const CENTIMETER: u8 = 0x26;
    /// Kilometres per hour
    pub const KM_PER_HOUR: u8 = 0x30;
    /// Tenths of a kilometre per hour
    pub const TENTH_KM_PER_HOUR: u8 = 0x31;
    /// Hundredths of a kilometre per hour
    pub const HUNDREDTH_KM_PER_HOUR: u8 = 0x32;
    /// Metres per minute
    pub const METER_PER_MINUTE: u8 = 0x33;
    /// Minutes per mile
    pub const MINUTES_PER_MILE: u8 = 0x37;
    /// Minutes per kilometre
    pub const MINUTES_PER_KM: u8 = 0x38;
    /// Seconds per kilometre
    pub const SECONDS_PER_KM: u8 = 0x39;
    /// Seconds per mile
    pub const SECONDS_PER_MILE: u8 = 0x3A;
    /// Revolutions per minute
    pub const REVS_PER_MINUTE: u8 = 0x53;
    /// Strides per minute
    pub const STRIDES_PER_MINUTE: u8 = 0x54;
    /// Strokes per minute
    pub const STROKES_PER_MINUTE: u8 = 0x55;
    /// Watts
    pub const WATTS: u8 = 0x59;
}

/// CSAFE GET commands used for elliptical/rower telemetry
///
/// This is deliberately not a full CSAFE command set; only the public-frame
/// GET subset the polling loop needs is modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    /// Request the state-machine status
    GetStatus = 0x80,
    /// Request horizontal distance travelled
    GetHorizontal = 0xA1,
    /// Request accumulated calories
    GetCalories = 0xA3,
    /// Request current speed
    GetSpeed = 0xA5,
    /// Request current pace
    GetPace = 0xA6,
    /// Request current cadence
    GetCadence = 0xA7,
    /// Request current heart rate
    GetHeartRate = 0xB0,
    /// Request current power output
    GetPower = 0xB4,
}

impl Command {
    /// Wire identifier for this command
    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Map a wire identifier back to a command
    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0x80 => Some(Self::GetStatus),
            0xA1 => Some(Self::GetHorizontal),
            0xA3 => Some(Self::GetCalories),
            0xA5 => Some(Self::GetSpeed),
            0xA6 => Some(Self::GetPace),
            0xA7 => Some(Self::GetCadence),
            0xB0 => Some(Self::GetHeartRate),
            0xB4 => Some(Self::GetPower),
            _ => None,
        }
    }
}

/// An ordered set of commands sent together in one request frame
///
/// Immutable once built; the scheduler hands batches to the poll loop one
/// per cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandBatch {
    commands: Vec<Command>,
}

impl CommandBatch {
    /// Create a batch from an ordered command list
    #[must_use]
    pub fn new(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    /// The refresh set polled when no ad-hoc batch is pending
    #[must_use]
    pub fn default_refresh() -> Self {
        Self::new(vec![
            Command::GetPower,
            Command::GetSpeed,
            Command::GetCalories,
            Command::GetHeartRate,
            Command::GetHorizontal,
            Command::GetStatus,
        ])
    }

    /// Commands in send order
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Whether the batch carries no commands
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Number of commands in the batch
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

impl From<Vec<Command>> for CommandBatch {
    fn from(commands: Vec<Command>) -> Self {
        Self::new(commands)
    }
}

impl FromIterator<Command> for CommandBatch {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// One numeric response field, unconverted
///
/// `unit` is the raw CSAFE unit code when the command carries one (see
/// [`unit`]); unit normalisation is the deriver's job, not the codec's.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    /// Field value as sent by the equipment
    pub value: f64,
    /// Raw unit code, if the field carries one
    pub unit: Option<u8>,
}

impl RawReading {
    /// Create a reading
    #[must_use]
    pub const fn new(value: f64, unit: Option<u8>) -> Self {
        Self { value, unit }
    }
}

/// A decoded response frame
///
/// Each field is `Some` only when the corresponding command's data could be
/// extracted from the frame. A field left `None` means "no update this
/// cycle" — never an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodedFrame {
    /// Machine status from the frame status byte (or a `GetStatus` record)
    pub status: Option<MachineStatus>,
    /// Power response
    pub power: Option<RawReading>,
    /// Speed response
    pub speed: Option<RawReading>,
    /// Pace response
    pub pace: Option<RawReading>,
    /// Cadence response
    pub cadence: Option<RawReading>,
    /// Heart-rate response
    pub heart_rate: Option<RawReading>,
    /// Calories response
    pub calories: Option<RawReading>,
    /// Horizontal distance response
    pub distance: Option<RawReading>,
}

impl DecodedFrame {
    /// Whether nothing at all was extracted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.readings().is_empty()
    }

    /// Commands for which this frame carries a value
    #[must_use]
    pub fn answered(&self) -> Vec<Command> {
        let mut commands = Vec::new();
        if self.status.is_some() {
            commands.push(Command::GetStatus);
        }
        if self.distance.is_some() {
            commands.push(Command::GetHorizontal);
        }
        if self.calories.is_some() {
            commands.push(Command::GetCalories);
        }
        if self.speed.is_some() {
            commands.push(Command::GetSpeed);
        }
        if self.pace.is_some() {
            commands.push(Command::GetPace);
        }
        if self.cadence.is_some() {
            commands.push(Command::GetCadence);
        }
        if self.heart_rate.is_some() {
            commands.push(Command::GetHeartRate);
        }
        if self.power.is_some() {
            commands.push(Command::GetPower);
        }
        commands
    }

    fn readings(&self) -> Vec<RawReading> {
        [
            self.power,
            self.speed,
            self.pace,
            self.cadence,
            self.heart_rate,
            self.calories,
            self.distance,
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn record(&mut self, command: Command, reading: RawReading) {
        match command {
            Command::GetStatus => {}
            Command::GetHorizontal => self.distance = Some(reading),
            Command::GetCalories => self.calories = Some(reading),
            Command::GetSpeed => self.speed = Some(reading),
            Command::GetPace => self.pace = Some(reading),
            Command::GetCadence => self.cadence = Some(reading),
            Command::GetHeartRate => self.heart_rate = Some(reading),
            Command::GetPower => self.power = Some(reading),
        }
    }
}

/// Encode a command batch into a request frame
///
/// Pure and deterministic: flag, byte-stuffed commands plus XOR checksum,
/// stop flag. The GET subset carries no command arguments.
#[must_use]
pub fn encode(batch: &CommandBatch) -> Bytes {
    let contents: Vec<u8> = batch.commands().iter().map(|c| c.id()).collect();
    let mut frame = BytesMut::with_capacity(contents.len() * 2 + 3);
    frame.put_u8(FLAG_START);
    frame.extend_from_slice(&stuff_contents(&contents));
    frame.put_u8(FLAG_STOP);
    frame.freeze()
}

/// Decode a response buffer, degrading to an empty frame on any error
///
/// The poll loop runs unattended against a half-duplex serial link that
/// routinely produces garbled or truncated frames; those must read as
/// "no new data", not failures.
#[must_use]
pub fn decode(buffer: &[u8]) -> DecodedFrame {
    match decode_strict(buffer) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!("discarding response: {e}");
            DecodedFrame::default()
        }
    }
}

/// Decode a response buffer, reporting why a frame was rejected
///
/// # Errors
///
/// Returns [`ErgolinkError::MalformedFrame`] when no start/stop flag is
/// found, the stuffing is invalid, the frame is too short, or the checksum
/// does not match.
pub fn decode_strict(buffer: &[u8]) -> Result<DecodedFrame> {
    let start = buffer
        .iter()
        .position(|&b| b == FLAG_START || b == FLAG_EXTENDED_START)
        .ok_or_else(|| malformed("no start flag"))?;
    let extended = buffer[start] == FLAG_EXTENDED_START;

    let body = &buffer[start + 1..];
    let stop = body
        .iter()
        .position(|&b| b == FLAG_STOP)
        .ok_or_else(|| malformed("no stop flag"))?;

    let contents = unstuff(&body[..stop])?;
    if contents.len() < 2 {
        return Err(malformed("frame too short"));
    }

    let (payload, checksum) = contents.split_at(contents.len() - 1);
    if xor_checksum(payload) != checksum[0] {
        return Err(malformed("checksum mismatch"));
    }

    // Extended frames prefix the payload with destination and source
    // addresses; the public-frame payload that follows is identical.
    let payload = if extended {
        if payload.len() < 3 {
            return Err(malformed("extended frame too short"));
        }
        &payload[2..]
    } else {
        payload
    };

    let mut frame = DecodedFrame {
        status: Some(MachineStatus::from_status_byte(payload[0])),
        ..DecodedFrame::default()
    };

    let mut rest = &payload[1..];
    while rest.len() >= 2 {
        let id = rest[0];
        let count = rest[1] as usize;
        if rest.len() < 2 + count {
            break;
        }
        let data = &rest[2..2 + count];
        if let Some(command) = Command::from_id(id) {
            if command == Command::GetStatus {
                if let Some(&byte) = data.first() {
                    frame.status = Some(MachineStatus::from_status_byte(byte));
                }
            } else if let Some(reading) = parse_reading(command, data) {
                frame.record(command, reading);
            }
        }
        rest = &rest[2 + count..];
    }

    Ok(frame)
}

/// Append the XOR checksum and byte-stuff the result
///
/// Shared by the request encoder and the response builders in tests.
pub(crate) fn stuff_contents(contents: &[u8]) -> Vec<u8> {
    let mut stuffed = Vec::with_capacity(contents.len() + 2);
    let checksum = xor_checksum(contents);
    for &byte in contents.iter().chain(std::iter::once(&checksum)) {
        if (FLAG_EXTENDED_START..=FLAG_STUFF).contains(&byte) {
            stuffed.push(FLAG_STUFF);
            stuffed.push(byte - FLAG_EXTENDED_START);
        } else {
            stuffed.push(byte);
        }
    }
    stuffed
}

fn unstuff(stuffed: &[u8]) -> Result<Vec<u8>> {
    let mut contents = Vec::with_capacity(stuffed.len());
    let mut bytes = stuffed.iter();
    while let Some(&byte) = bytes.next() {
        if byte == FLAG_STUFF {
            match bytes.next() {
                Some(&code) if code <= 0x03 => contents.push(FLAG_EXTENDED_START + code),
                Some(_) => return Err(malformed("invalid stuff sequence")),
                None => return Err(malformed("dangling stuff flag")),
            }
        } else {
            contents.push(byte);
        }
    }
    Ok(contents)
}

fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, &b| acc ^ b)
}

/// Interpret one response record's data bytes
///
/// Heart rate and calories are plain little-endian integers; every other
/// modelled command trails a one-byte unit code after the value.
fn parse_reading(command: Command, data: &[u8]) -> Option<RawReading> {
    match command {
        Command::GetHeartRate | Command::GetCalories => {
            if data.is_empty() {
                None
            } else {
                Some(RawReading::new(le_value(data), None))
            }
        }
        _ => match data.len() {
            0 => None,
            1 => Some(RawReading::new(f64::from(data[0]), None)),
            n => Some(RawReading::new(
                le_value(&data[..n - 1]),
                Some(data[n - 1]),
            )),
        },
    }
}

fn le_value(data: &[u8]) -> f64 {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate().take(8) {
        value |= u64::from(byte) << (8 * i);
    }
    value as f64
}

fn malformed(reason: &str) -> ErgolinkError {
    ErgolinkError::MalformedFrame(reason.to_string())
}
