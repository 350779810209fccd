#![allow(dead_code)]

use std::collections::HashSet;
use std::fmt;

use chrono::{Local, LocalResult, TimeZone};
use serde::Deserialize;
use thiserror::Error;

/// High-word pattern SMA inverters report while a power reading is
/// momentarily undefined, e.g. before sunrise. A device quirk, not a Modbus
/// rule; such readings decode to zero.
pub const UNDEFINED_SENTINEL: u16 = 0x8000;

/// Normalized active power limit register in percent of nominal (SMA "Pnom").
pub const DEFAULT_SETPOINT_ADDRESS: u16 = 40_016;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeKind {
    /// Signed 16-bit quantity in the low word, sentinel-aware.
    RawSigned,
    /// Unsigned 32-bit seconds since the Unix epoch.
    EpochSeconds,
    /// Same count as `EpochSeconds`, rendered as a local calendar timestamp.
    EpochTimestamp,
}

/// One holding register to read each telemetry pass. Built once at startup
/// from configuration, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisterDef {
    pub name: String,
    pub address: u16,
    pub kind: DecodeKind,
}

impl RegisterDef {
    pub fn new(name: impl Into<String>, address: u16, kind: DecodeKind) -> Self {
        Self {
            name: name.into(),
            address,
            kind,
        }
    }
}

/// A decoded register value; `Display` yields the topic payload text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    Integer(i64),
    Timestamp(String),
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Integer(value) => write!(f, "{value}"),
            Reading::Timestamp(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("register catalog is empty")]
    Empty,
    #[error("duplicate register name {0}")]
    DuplicateName(String),
}

/// Decodes the two words backing one register. Total: every word pair maps to
/// a reading, word-count violations are rejected at the transport boundary
/// before this runs.
pub fn decode(kind: DecodeKind, words: [u16; 2]) -> Reading {
    match kind {
        DecodeKind::RawSigned => {
            if words[0] == UNDEFINED_SENTINEL {
                Reading::Integer(0)
            } else {
                Reading::Integer(i64::from(words[1] as i16))
            }
        }
        DecodeKind::EpochSeconds => Reading::Integer(i64::from(epoch_seconds(words))),
        DecodeKind::EpochTimestamp => Reading::Timestamp(local_timestamp(epoch_seconds(words))),
    }
}

fn epoch_seconds(words: [u16; 2]) -> u32 {
    u32::from(words[0]) << 16 | u32::from(words[1])
}

fn local_timestamp(secs: u32) -> String {
    match Local.timestamp_opt(i64::from(secs), 0) {
        LocalResult::Single(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        // Epoch-to-local conversion is unambiguous; keep the raw count if the
        // platform timezone data says otherwise.
        _ => secs.to_string(),
    }
}

pub fn validate_catalog(defs: &[RegisterDef]) -> Result<(), CatalogError> {
    if defs.is_empty() {
        return Err(CatalogError::Empty);
    }

    let mut seen = HashSet::new();
    for def in defs {
        if !seen.insert(def.name.as_str()) {
            return Err(CatalogError::DuplicateName(def.name.clone()));
        }
    }

    Ok(())
}

/// Register set the original deployment reads from SMA Sunny Boy class
/// inverters. `TIME` and `STIME` share an address and differ only in
/// rendering.
pub fn default_catalog() -> Vec<RegisterDef> {
    vec![
        RegisterDef::new("TIME", 30_193, DecodeKind::EpochSeconds),
        RegisterDef::new("STIME", 30_193, DecodeKind::EpochTimestamp),
        RegisterDef::new("P_DC", 30_961, DecodeKind::RawSigned),
        RegisterDef::new("P_AC", 30_775, DecodeKind::RawSigned),
    ]
}
