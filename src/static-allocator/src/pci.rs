// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! PCI addressing primitives shared by the board, scenario and allocation models.

use std::fmt::{self, Debug, Display};
use std::num::ParseIntError;
use std::str::FromStr;

use serde::de::Visitor;
use serde::{Deserialize, Serialize};

/// Highest device number on a PCI bus.
pub const MAX_DEVICE: u8 = 0x1f;
/// Highest function number of a PCI device.
pub const MAX_FUNCTION: u8 = 0x7;

/// Class code of a VGA-compatible display controller.
pub const PCI_CLASS_VGA: u32 = 0x03_0000;
/// Device number of the integrated graphics device on bus 0.
pub const IGD_DEVICE: u8 = 0x2;

/// Errors associated with parsing a PCI address.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum BdfParseError {
    /// Malformed PCI address {0:?}: expected `[ssss:]bb:dd.f`
    Format(String),
    /// Malformed PCI address {0:?}: {1}
    Number(String, ParseIntError),
    /// PCI address {0:?} is out of range
    Range(String),
}

/// A PCI segment:bus:device.function address.
///
/// The raw value uses the `(segment << 16) | (bus << 8) | (device << 3) | function` layout that
/// the hypervisor consumes directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciBdf(u32);

impl PciBdf {
    pub const fn new(segment: u16, bus: u8, device: u8, function: u8) -> Self {
        Self(
            ((segment as u32) << 16)
                | ((bus as u32) << 8)
                | (((device & MAX_DEVICE) as u32) << 3)
                | (function & MAX_FUNCTION) as u32,
        )
    }

    pub fn segment(&self) -> u16 {
        ((self.0 >> 16) & 0xffff) as u16
    }

    pub fn bus(&self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub fn device(&self) -> u8 {
        ((self.0 >> 3) & 0x1f) as u8
    }

    pub fn function(&self) -> u8 {
        (self.0 & 0x7) as u8
    }

    /// The raw segment/bus/device/function encoding.
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Whether this is the native location of the integrated graphics device.
    pub fn is_igd_slot(&self) -> bool {
        self.segment() == 0 && self.bus() == 0 && self.device() == IGD_DEVICE
    }
}

impl From<u32> for PciBdf {
    fn from(bdf: u32) -> Self {
        Self(bdf)
    }
}

impl From<PciBdf> for u32 {
    fn from(bdf: PciBdf) -> Self {
        bdf.0
    }
}

impl Debug for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:01x}",
            self.segment(),
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

// Segment 0 is the only one the hypervisor addresses, so it is omitted from the short form.
impl Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segment() != 0 {
            write!(f, "{:04x}:", self.segment())?;
        }
        write!(
            f,
            "{:02x}:{:02x}.{:01x}",
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

impl FromStr for PciBdf {
    type Err = BdfParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Scenario entries may carry a trailing device description, e.g. "00:14.0 USB controller".
        let bdf = s.split_whitespace().next().unwrap_or_default();
        let (rest, function) = bdf
            .rsplit_once('.')
            .ok_or_else(|| BdfParseError::Format(s.to_string()))?;
        let items: Vec<&str> = rest.split(':').collect();
        let (segment, bus, device) = match items.as_slice() {
            [bus, device] => ("0", *bus, *device),
            [segment, bus, device] => (*segment, *bus, *device),
            _ => return Err(BdfParseError::Format(s.to_string())),
        };

        let number = |item: &str| {
            u32::from_str_radix(item, 16).map_err(|err| BdfParseError::Number(s.to_string(), err))
        };
        let (segment, bus, device, function) =
            (number(segment)?, number(bus)?, number(device)?, number(function)?);
        if segment > 0xffff
            || bus > 0xff
            || device > u32::from(MAX_DEVICE)
            || function > u32::from(MAX_FUNCTION)
        {
            return Err(BdfParseError::Range(s.to_string()));
        }

        Ok(PciBdf((segment << 16) | (bus << 8) | (device << 3) | function))
    }
}

struct PciBdfVisitor;

impl Visitor<'_> for PciBdfVisitor {
    type Value = PciBdf;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a PCI address string")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for PciBdf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(PciBdfVisitor)
    }
}

impl Serialize for PciBdf {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(&self.to_string())
    }
}

/// PCI has four interrupt pins A->D.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PciInterruptPin {
    #[serde(rename = "INTA#")]
    IntA,
    #[serde(rename = "INTB#")]
    IntB,
    #[serde(rename = "INTC#")]
    IntC,
    #[serde(rename = "INTD#")]
    IntD,
}

impl PciInterruptPin {
    fn from_index(index: u8) -> Self {
        match index % 4 {
            0 => Self::IntA,
            1 => Self::IntB,
            2 => Self::IntC,
            _ => Self::IntD,
        }
    }

    /// The pin seen on the upstream side of a PCI-to-PCI bridge for a device at `device` on
    /// the secondary bus.
    pub fn swizzle(self, device: u8) -> Self {
        Self::from_index((self as u8).wrapping_add(device % 4))
    }
}

impl Display for PciInterruptPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IntA => "INTA#",
            Self::IntB => "INTB#",
            Self::IntC => "INTC#",
            Self::IntD => "INTD#",
        };
        f.write_str(name)
    }
}
