//! Omaha protocol (subset) wire types.
//!
//! Only the app / event / updatecheck / manifest / package elements needed to
//! check for and download an update are modelled. Attributes use quick-xml's
//! `@name` convention.

use crate::error::{Result, UnattendedError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Protocol version sent with every request
pub const PROTOCOL_VERSION: &str = "3.0";

/// Default update channel
pub const DEFAULT_CHANNEL: &str = "stable";

/// Status value the server uses for success
pub const STATUS_OK: &str = "ok";

/// Update check status when nothing newer exists
pub const STATUS_NO_UPDATE: &str = "noupdate";

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Omaha event type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventType {
    #[default]
    Unknown,
    UpdateCheck,
    UpdateDownload,
    UpdateInstall,
    UpdateRollback,
    Ping,
}

impl EventType {
    pub fn code(&self) -> u32 {
        match self {
            EventType::Unknown => 0,
            EventType::UpdateCheck => 1,
            EventType::UpdateDownload => 2,
            EventType::UpdateInstall => 3,
            EventType::UpdateRollback => 4,
            EventType::Ping => 800,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(EventType::Unknown),
            1 => Some(EventType::UpdateCheck),
            2 => Some(EventType::UpdateDownload),
            3 => Some(EventType::UpdateInstall),
            4 => Some(EventType::UpdateRollback),
            800 => Some(EventType::Ping),
            _ => None,
        }
    }
}

/// Omaha event result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventResult {
    Unknown,
    #[default]
    NoUpdate,
    Available,
    Success,
    SuccessRestarted,
    Error,
    Cancelled,
    Started,
}

impl EventResult {
    pub fn code(&self) -> u32 {
        match self {
            EventResult::Unknown => 0,
            EventResult::NoUpdate => 1,
            EventResult::Available => 2,
            EventResult::Success => 3,
            EventResult::SuccessRestarted => 4,
            EventResult::Error => 5,
            EventResult::Cancelled => 6,
            EventResult::Started => 7,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(EventResult::Unknown),
            1 => Some(EventResult::NoUpdate),
            2 => Some(EventResult::Available),
            3 => Some(EventResult::Success),
            4 => Some(EventResult::SuccessRestarted),
            5 => Some(EventResult::Error),
            6 => Some(EventResult::Cancelled),
            7 => Some(EventResult::Started),
            _ => None,
        }
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = u32::deserialize(deserializer)?;
        EventType::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown event type {}", code)))
    }
}

impl Serialize for EventResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for EventResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = u32::deserialize(deserializer)?;
        EventResult::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown event result {}", code)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OmahaEvent {
    #[serde(rename = "@eventtype")]
    pub event_type: EventType,
    #[serde(rename = "@eventresult")]
    pub event_result: EventResult,
}

impl OmahaEvent {
    pub fn new(event_type: EventType, event_result: EventResult) -> Self {
        Self {
            event_type,
            event_result,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OmahaUrl {
    #[serde(rename = "@codebase", default)]
    pub codebase: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OmahaPackage {
    /// Expected SHA-256 digest, hex encoded
    #[serde(rename = "@hash", default)]
    pub hash: String,
    #[serde(rename = "@name", default)]
    pub name: String,
    /// Expected size in bytes
    #[serde(rename = "@size", default)]
    pub size: u64,
}

/// A server-advertised update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OmahaManifest {
    #[serde(rename = "@version", default)]
    pub version: String,
    /// Server trace / correlation id
    #[serde(rename = "@trace", default)]
    pub trace: String,
    #[serde(default)]
    pub url: OmahaUrl,
    #[serde(default)]
    pub package: OmahaPackage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OmahaUpdateCheck {
    #[serde(rename = "@status", default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<OmahaManifest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OmahaApp {
    #[serde(rename = "@appid", default)]
    pub id: String,
    #[serde(rename = "@status", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "@version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "@track", default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(rename = "@bootid", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<OmahaEvent>,
    #[serde(rename = "updatecheck", default, skip_serializing_if = "Option::is_none")]
    pub update_check: Option<OmahaUpdateCheck>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "request")]
pub struct OmahaRequest {
    #[serde(rename = "@protocol")]
    pub protocol: String,
    pub app: OmahaApp,
}

impl OmahaRequest {
    /// Update-check request for one application
    pub fn update_check(app_id: &str, installed_version: &str, channel: &str, client_id: &str) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            app: OmahaApp {
                id: app_id.to_string(),
                status: None,
                version: Some(installed_version.to_string()),
                channel: Some(channel.to_string()),
                client_id: Some(client_id.to_string()),
                event: Some(OmahaEvent::new(EventType::UpdateCheck, EventResult::Started)),
                update_check: None,
            },
        }
    }

    /// Serialize to the XML request body
    pub fn to_xml(&self) -> Result<String> {
        let body = quick_xml::se::to_string(self).map_err(|e| UnattendedError::Xml(e.to_string()))?;
        Ok(format!("{}{}", XML_DECLARATION, body))
    }

    pub fn from_xml(xml: &str) -> Result<Self> {
        quick_xml::de::from_str(xml).map_err(|e| UnattendedError::Xml(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "response")]
pub struct OmahaResponse {
    #[serde(rename = "@protocol", default)]
    pub protocol: String,
    #[serde(rename = "@server", default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    pub app: OmahaApp,
}

impl OmahaResponse {
    pub fn from_xml(xml: &str) -> Result<Self> {
        quick_xml::de::from_str(xml).map_err(|e| UnattendedError::Xml(e.to_string()))
    }

    pub fn to_xml(&self) -> Result<String> {
        let body = quick_xml::se::to_string(self).map_err(|e| UnattendedError::Xml(e.to_string()))?;
        Ok(format!("{}{}", XML_DECLARATION, body))
    }

    /// Outer application status is "ok"
    pub fn is_app_ok(&self) -> bool {
        self.app.status.as_deref() == Some(STATUS_OK)
    }

    /// Inner update-check status, if the server sent one
    pub fn update_status(&self) -> Option<&str> {
        self.app.update_check.as_ref().map(|u| u.status.as_str())
    }

    /// The advertised manifest when the update check says "ok"
    pub fn available_manifest(&self) -> Option<&OmahaManifest> {
        let check = self.app.update_check.as_ref()?;
        if check.status == STATUS_OK {
            check.manifest.as_ref()
        } else {
            None
        }
    }
}
