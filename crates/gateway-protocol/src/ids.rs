//! Validated device and module identifiers.
//!
//! A device id is a fixed 9-character string whose leading character encodes
//! a [`DeviceType`]. A module id is a fixed 7-character string whose three
//! leading digits encode a [`ModuleType`] out of a closed set of 28 kinds.
//! Both newtypes can only be constructed through `parse`, so a `DeviceId` or
//! `ModuleId` in hand is always valid.

use std::fmt;

pub const DEVICE_ID_LEN: usize = 9;
pub const MODULE_ID_LEN: usize = 7;

/// The type encoded by a device id's leading character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Node,
    Bridge,
    Controller,
}

impl DeviceType {
    fn from_digit(d: u8) -> Option<Self> {
        match d {
            0 => Some(Self::Node),
            1 => Some(Self::Bridge),
            2 => Some(Self::Controller),
            _ => None,
        }
    }
}

/// One of the 28 capability kinds a module id's leading three digits encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ModuleType {
    Dummy = 0,
    Temp = 1,
    Ldr = 2,
    Hum = 3,
    Zmon = 4,
    AcPower = 5,
    DcPower = 6,
    Amps = 7,
    Volts = 8,
    Watts = 9,
    Rain = 10,
    Sonar = 11,
    Led = 12,
    Rgb = 13,
    Lcd16x2 = 14,
    ButtonShort = 15,
    ButtonLong = 16,
    Flag1 = 17,
    Flag2 = 18,
    Flag3 = 19,
    Flag4 = 20,
    Flag5 = 21,
    Script = 22,
    Bandwidth = 23,
    Serial = 24,
    Mqtt = 25,
    SigUsr1 = 26,
    SigUsr2 = 27,
}

impl ModuleType {
    pub const COUNT: u16 = 28;

    pub fn from_code(code: u16) -> Option<Self> {
        use ModuleType::*;
        Some(match code {
            0 => Dummy,
            1 => Temp,
            2 => Ldr,
            3 => Hum,
            4 => Zmon,
            5 => AcPower,
            6 => DcPower,
            7 => Amps,
            8 => Volts,
            9 => Watts,
            10 => Rain,
            11 => Sonar,
            12 => Led,
            13 => Rgb,
            14 => Lcd16x2,
            15 => ButtonShort,
            16 => ButtonLong,
            17 => Flag1,
            18 => Flag2,
            19 => Flag3,
            20 => Flag4,
            21 => Flag5,
            22 => Script,
            23 => Bandwidth,
            24 => Serial,
            25 => Mqtt,
            26 => SigUsr1,
            27 => SigUsr2,
            _ => return None,
        })
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        use ModuleType::*;
        match self {
            Dummy => "dummy",
            Temp => "temp",
            Ldr => "ldr",
            Hum => "hum",
            Zmon => "zmon",
            AcPower => "acpower",
            DcPower => "dcpower",
            Amps => "amps",
            Volts => "volts",
            Watts => "watts",
            Rain => "rain",
            Sonar => "sonar",
            Led => "led",
            Rgb => "rgb",
            Lcd16x2 => "lcd16x2",
            ButtonShort => "bts",
            ButtonLong => "btl",
            Flag1 => "flag1",
            Flag2 => "flag2",
            Flag3 => "flag3",
            Flag4 => "flag4",
            Flag5 => "flag5",
            Script => "script",
            Bandwidth => "bandwidth",
            Serial => "serial",
            Mqtt => "mqtt",
            SigUsr1 => "sigusr1",
            SigUsr2 => "sigusr2",
        }
    }
}

/// A validated 9-character device id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != DEVICE_ID_LEN {
            return None;
        }
        let lead = s.as_bytes()[0];
        if !(b'0'..=b'2').contains(&lead) {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn device_type(&self) -> DeviceType {
        DeviceType::from_digit(self.0.as_bytes()[0] - b'0')
            .expect("DeviceId is only constructed through parse")
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated 7-character module id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != MODULE_ID_LEN {
            return None;
        }
        let digits = &s[0..3];
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let code: u16 = digits.parse().ok()?;
        ModuleType::from_code(code)?;
        Some(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn module_type(&self) -> ModuleType {
        ModuleType::from_code(self.0[0..3].parse().expect("validated at parse"))
            .expect("ModuleId is only constructed through parse")
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed ids for the bridge's own singleton modules, carried over from the
/// original implementation so persisted device files stay compatible.
pub const MODULE_SCRIPT_ID: &str = "022FFA1";
pub const MODULE_BANDWIDTH_ID: &str = "023FFA1";
pub const MODULE_SERIAL_ID: &str = "024FFA1";
pub const MODULE_MQTT_ID: &str = "025FFA1";
pub const MODULE_SIGUSR1_ID: &str = "026FFA1";
pub const MODULE_SIGUSR2_ID: &str = "027FFA1";
