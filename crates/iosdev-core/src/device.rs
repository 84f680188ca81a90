//! Device domain entities and value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for an attached device (its UDID).
///
/// Opaque to us: the device library hands it out and we only compare it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the identifier is empty.
    ///
    /// Empty identifiers are rejected at the API boundary.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Transport
// ============================================================================

/// How a device is reachable.
///
/// `Local` is the cable (USB) connection, `Network` is Wi-Fi. Ordering puts
/// the cable first, which is also the order interfaces are reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportKind {
    #[serde(rename = "USB")]
    Local,
    #[serde(rename = "Wi-Fi")]
    Network,
}

impl TransportKind {
    /// Label used in device listings.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local => "USB",
            Self::Network => "Wi-Fi",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Device Color
// ============================================================================

/// Enclosure colors the device reports as numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceColor {
    White,
    Black,
    Silver,
    Gold,
    RoseGold,
    JetBlack,
}

impl DeviceColor {
    /// Maps the raw `DeviceColor` code to a known color.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "0" => Some(Self::White),
            "1" => Some(Self::Black),
            "2" => Some(Self::Silver),
            "3" => Some(Self::Gold),
            "4" => Some(Self::RoseGold),
            "5" => Some(Self::JetBlack),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::White => "White",
            Self::Black => "Black",
            Self::Silver => "Silver",
            Self::Gold => "Gold",
            Self::RoseGold => "Rose Gold",
            Self::JetBlack => "Jet Black",
        }
    }
}

/// Normalizes a raw color code to its label. Unknown codes pass through.
pub fn normalize_device_color(raw: &str) -> String {
    DeviceColor::from_code(raw)
        .map(|c| c.label().to_string())
        .unwrap_or_else(|| raw.to_string())
}

// ============================================================================
// Properties
// ============================================================================

/// The type a property is read as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Text,
    Flag,
}

/// A typed property value read from a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Text(String),
    Flag(bool),
}

impl PropertyValue {
    /// The value returned when a property is absent.
    pub fn empty(kind: PropertyKind) -> Self {
        match kind {
            PropertyKind::Text => Self::Text(String::new()),
            PropertyKind::Flag => Self::Flag(false),
        }
    }

    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Text(_) => PropertyKind::Text,
            Self::Flag(_) => PropertyKind::Flag,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Flag(_) => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            Self::Text(_) => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Flag(b)
    }
}

/// The canonical property set read once when a device first attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceProperty {
    Name,
    BuildVersion,
    CpuArchitecture,
    DeviceClass,
    DeviceColor,
    HardwareModel,
    ModelNumber,
    ProductType,
    ProductVersion,
    SerialNumber,
    TrustedHostAttached,
}

impl DeviceProperty {
    pub const ALL: [DeviceProperty; 11] = [
        Self::Name,
        Self::BuildVersion,
        Self::CpuArchitecture,
        Self::DeviceClass,
        Self::DeviceColor,
        Self::HardwareModel,
        Self::ModelNumber,
        Self::ProductType,
        Self::ProductVersion,
        Self::SerialNumber,
        Self::TrustedHostAttached,
    ];

    /// Key the device library knows this property by.
    pub fn native_key(&self) -> &'static str {
        match self {
            Self::Name => "DeviceName",
            Self::BuildVersion => "BuildVersion",
            Self::CpuArchitecture => "CPUArchitecture",
            Self::DeviceClass => "DeviceClass",
            Self::DeviceColor => "DeviceColor",
            Self::HardwareModel => "HardwareModel",
            Self::ModelNumber => "ModelNumber",
            Self::ProductType => "ProductType",
            Self::ProductVersion => "ProductVersion",
            Self::SerialNumber => "SerialNumber",
            Self::TrustedHostAttached => "TrustedHostAttached",
        }
    }

    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::TrustedHostAttached => PropertyKind::Flag,
            _ => PropertyKind::Text,
        }
    }
}

/// Cached device properties as exposed to consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProperties {
    pub name: String,
    pub build_version: String,
    pub cpu_architecture: String,
    pub device_class: String,
    pub device_color: String,
    pub hardware_model: String,
    pub model_number: String,
    pub product_type: String,
    pub product_version: String,
    pub serial_number: String,
    pub trusted_host_attached: bool,
}

impl DeviceProperties {
    /// Stores a value read for `property`.
    ///
    /// Values of the wrong type are ignored. `DeviceColor` is normalized.
    pub fn set(&mut self, property: DeviceProperty, value: PropertyValue) {
        if property == DeviceProperty::TrustedHostAttached {
            if let Some(flag) = value.as_flag() {
                self.trusted_host_attached = flag;
            }
            return;
        }

        let Some(text) = value.as_text() else {
            return;
        };

        let slot = match property {
            DeviceProperty::Name => &mut self.name,
            DeviceProperty::BuildVersion => &mut self.build_version,
            DeviceProperty::CpuArchitecture => &mut self.cpu_architecture,
            DeviceProperty::DeviceClass => &mut self.device_class,
            DeviceProperty::DeviceColor => {
                self.device_color = normalize_device_color(text);
                return;
            }
            DeviceProperty::HardwareModel => &mut self.hardware_model,
            DeviceProperty::ModelNumber => &mut self.model_number,
            DeviceProperty::ProductType => &mut self.product_type,
            DeviceProperty::ProductVersion => &mut self.product_version,
            DeviceProperty::SerialNumber => &mut self.serial_number,
            DeviceProperty::TrustedHostAttached => return,
        };
        *slot = text.to_string();
    }
}

// ============================================================================
// View
// ============================================================================

/// Read-only snapshot of a visible device, as listed to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub udid: DeviceId,

    /// Live transports, cable first.
    pub interfaces: Vec<TransportKind>,

    #[serde(flatten)]
    pub properties: DeviceProperties,

    /// When the device was first seen by the watcher.
    pub first_seen: DateTime<Utc>,
}

impl DeviceView {
    /// Returns true if the device is reachable over the cable.
    pub fn has_cable(&self) -> bool {
        self.interfaces.contains(&TransportKind::Local)
    }
}
