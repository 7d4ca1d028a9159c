//! Application request and event type codes.

use std::fmt;

/// Application request types (byte 0 of a request message body).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AppRequestType {
    StopProgram = 0x01,
    GetProjectFile = 0x02,
    PutProjectFile = 0x03,
    DeleteProject = 0x04,
    SyntaxCheck = 0x05,
    RunProgram = 0x06,
    GetProjects = 0x07,
    GetAutostart = 0x08,
    PutAutostart = 0x09,
    ReadyForEvents = 0x0A,
    RequestPairing = 0x0B,
    RemovePairing = 0x0C,
    StartDiscovery = 0x0D,
}

impl AppRequestType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::StopProgram,
            0x02 => Self::GetProjectFile,
            0x03 => Self::PutProjectFile,
            0x04 => Self::DeleteProject,
            0x05 => Self::SyntaxCheck,
            0x06 => Self::RunProgram,
            0x07 => Self::GetProjects,
            0x08 => Self::GetAutostart,
            0x09 => Self::PutAutostart,
            0x0A => Self::ReadyForEvents,
            0x0B => Self::RequestPairing,
            0x0C => Self::RemovePairing,
            0x0D => Self::StartDiscovery,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for AppRequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StopProgram => "StopProgram",
            Self::GetProjectFile => "GetProjectFile",
            Self::PutProjectFile => "PutProjectFile",
            Self::DeleteProject => "DeleteProject",
            Self::SyntaxCheck => "SyntaxCheck",
            Self::RunProgram => "RunProgram",
            Self::GetProjects => "GetProjects",
            Self::GetAutostart => "GetAutostart",
            Self::PutAutostart => "PutAutostart",
            Self::ReadyForEvents => "ReadyForEvents",
            Self::RequestPairing => "RequestPairing",
            Self::RemovePairing => "RemovePairing",
            Self::StartDiscovery => "StartDiscovery",
        };
        write!(f, "{}", name)
    }
}

/// Application event types (byte 0 of an event message body).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AppEventType {
    Log = 0x01,
    PortStatus = 0x02,
    Command = 0x03,
    BtClassicDevices = 0x04,
}

impl AppEventType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Log),
            0x02 => Some(Self::PortStatus),
            0x03 => Some(Self::Command),
            0x04 => Some(Self::BtClassicDevices),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
