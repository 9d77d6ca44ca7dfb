// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Identity handshake and mainframe walk shared by the bridge and PID agents
//! (`spec.md` §4.1 "Identity handshake", "Mainframe walk").
//!
//! Grounded directly on `devices.py`'s `SimDevice._postconnect` and
//! `_walk_mainframe`: query `*IDN?`, and if the housing answers as the
//! SIM900 mainframe rather than the addressed instrument, step through
//! slots 1..=8 issuing `CONN <slot>, '<exit-token>'` until the expected
//! model responds.

use crate::error::Error;
use crate::serial::SerialChannel;

const EXIT_TOKEN: &str = "xyz";
const EXPECTED_MANUFACTURER: &str = "Stanford_Research_Systems";

/// Parsed `*IDN?` response: `manufacturer,model,sn,firmware`.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware: String,
}

impl Identity {
    fn parse(raw: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
        let [manufacturer, model, sn, firmware] = fields[..] else {
            return Err(Error::Protocol(format!("unable to parse *IDN? response: {raw:?}")));
        };
        Ok(Self {
            manufacturer: manufacturer.to_owned(),
            model: model.to_owned(),
            serial_number: sn.to_owned(),
            firmware: firmware.to_owned(),
        })
    }
}

/// Query identity, walk the mainframe if needed, and verify the expected
/// model is present. Returns the final identity of the addressed instrument.
pub async fn connect_and_identify(channel: &SerialChannel, expected_model: &str) -> Result<Identity, Error> {
    let raw = channel.query("*IDN?").await?;
    if let Ok(probe) = Identity::parse(&raw) {
        if probe.model == "SIM900" {
            walk_mainframe(channel, expected_model).await?;
        }
    }

    let raw = channel.query("*IDN?").await?;
    let identity = Identity::parse(&raw).unwrap_or(Identity {
        manufacturer: String::new(),
        model: String::new(),
        serial_number: String::new(),
        firmware: String::new(),
    });

    if identity.manufacturer != EXPECTED_MANUFACTURER || identity.model != expected_model {
        return Err(Error::IdentityMismatch {
            expected_manufacturer: EXPECTED_MANUFACTURER.to_owned(),
            expected_model: expected_model.to_owned(),
            got: raw,
        });
    }

    Ok(identity)
}

async fn walk_mainframe(channel: &SerialChannel, expected_model: &str) -> Result<u8, Error> {
    for slot in 1..=8u8 {
        channel.send(&format!("CONN {slot}, '{EXIT_TOKEN}'")).await?;
        let raw = channel.query("*IDN?").await?;
        let identity = Identity::parse(&raw)?;
        if identity.model == expected_model {
            return Ok(slot);
        }
        channel.send(EXIT_TOKEN).await?;
    }
    Err(Error::NotPresent { model: expected_model.to_owned() })
}

/// Emit the mainframe exit token before disconnecting, if a slot is held
/// (`devices.py`'s `_predisconnect`).
pub async fn exit_mainframe(channel: &SerialChannel) -> Result<(), Error> {
    channel.send(EXIT_TOKEN).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_idn() {
        let identity = Identity::parse("Stanford_Research_Systems,SIM921,s/n12345,v1.07").unwrap();
        assert_eq!(identity.model, "SIM921");
        assert_eq!(identity.firmware, "v1.07");
    }

    #[test]
    fn rejects_malformed_idn() {
        assert!(Identity::parse("garbage").is_err());
    }
}
