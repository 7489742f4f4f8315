//! Distinguished names.
//!
//! Subjects are written as `CN=example.com, O=Acme, C=US`. Only the six
//! attributes a CA deals with are supported: C, ST, L, O, OU and CN.

use std::fmt;

use const_oid::ObjectIdentifier;
use der::asn1::{Any, SetOfVec};
use der::{Tag, Tagged};
use thiserror::Error;
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};

use crate::error::PkiError;

const OID_C: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
const OID_ST: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.8");
const OID_L: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.7");
const OID_O: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
const OID_OU: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");
const OID_CN: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

/// A subject DN that could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct InvalidDn(String);

impl From<InvalidDn> for PkiError {
    fn from(err: InvalidDn) -> Self {
        PkiError::CsrConstruction(format!("subject DN: {}", err.0))
    }
}

/// Subject DN split into its component fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    /// Country (C), two letters.
    pub country: Option<String>,
    /// State or province (ST).
    pub state: Option<String>,
    /// Locality (L).
    pub locality: Option<String>,
    /// Organization (O).
    pub organization: Option<String>,
    /// Organizational unit (OU).
    pub organizational_unit: Option<String>,
    /// Common name (CN).
    pub common_name: Option<String>,
}

impl DistinguishedName {
    /// Parses `KEY=value` pairs separated by commas. `\,` escapes a comma.
    pub fn parse(input: &str) -> Result<Self, InvalidDn> {
        let mut dn = Self::default();

        for part in split_unescaped(input) {
            let part = part.trim();
            if part.is_empty() {
                return Err(InvalidDn("empty component".into()));
            }
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| InvalidDn(format!("'{part}' is not KEY=value")))?;
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim().replace("\\,", ",");
            if value.is_empty() {
                return Err(InvalidDn(format!("{key} has an empty value")));
            }

            let slot = match key.as_str() {
                "C" => &mut dn.country,
                "ST" => &mut dn.state,
                "L" => &mut dn.locality,
                "O" => &mut dn.organization,
                "OU" => &mut dn.organizational_unit,
                "CN" => &mut dn.common_name,
                other => return Err(InvalidDn(format!("unsupported attribute '{other}'"))),
            };
            if slot.is_some() {
                return Err(InvalidDn(format!("{key} given more than once")));
            }
            *slot = Some(value);
        }

        if let Some(country) = &dn.country {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(InvalidDn(format!("C must be a two-letter code, got '{country}'")));
            }
        }
        if dn.fields().next().is_none() {
            return Err(InvalidDn("no attributes".into()));
        }

        Ok(dn)
    }

    /// Reads the supported attributes from an X.509 name. Others are skipped.
    pub fn from_name(name: &Name) -> Result<Self, InvalidDn> {
        let mut dn = Self::default();

        for rdn in name.0.iter() {
            for atv in rdn.0.iter() {
                let slot = match atv.oid {
                    oid if oid == OID_C => &mut dn.country,
                    oid if oid == OID_ST => &mut dn.state,
                    oid if oid == OID_L => &mut dn.locality,
                    oid if oid == OID_O => &mut dn.organization,
                    oid if oid == OID_OU => &mut dn.organizational_unit,
                    oid if oid == OID_CN => &mut dn.common_name,
                    _ => continue,
                };
                *slot = Some(decode_string(&atv.value)?);
            }
        }

        Ok(dn)
    }

    /// Encodes the DN, most significant attribute first (C .. CN).
    pub fn to_name(&self) -> Result<Name, PkiError> {
        let mut rdns = Vec::new();

        for (oid, value) in self.fields() {
            let tag = if oid == OID_C {
                Tag::PrintableString
            } else {
                Tag::Utf8String
            };
            let atv = AttributeTypeAndValue {
                oid,
                value: Any::new(tag, value.as_bytes())?,
            };
            let set = SetOfVec::try_from(vec![atv])?;
            rdns.push(RelativeDistinguishedName(set));
        }

        Ok(RdnSequence(rdns))
    }

    fn fields(&self) -> impl Iterator<Item = (ObjectIdentifier, &str)> {
        [
            (OID_C, &self.country),
            (OID_ST, &self.state),
            (OID_L, &self.locality),
            (OID_O, &self.organization),
            (OID_OU, &self.organizational_unit),
            (OID_CN, &self.common_name),
        ]
        .into_iter()
        .filter_map(|(oid, value)| value.as_deref().map(|v| (oid, v)))
    }
}

impl fmt::Display for DistinguishedName {
    /// Least significant first, like RFC 4514: `CN=..., O=..., C=...`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<(ObjectIdentifier, &str)> = self.fields().collect();
        for (i, (oid, value)) in parts.iter().rev().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", short_name(*oid), value.replace(',', "\\,"))?;
        }
        Ok(())
    }
}

/// Formats an X.509 name for records and logs.
pub fn display_name(name: &Name) -> String {
    match DistinguishedName::from_name(name) {
        Ok(dn) if dn.fields().next().is_some() => dn.to_string(),
        _ => name.to_string(),
    }
}

fn short_name(oid: ObjectIdentifier) -> &'static str {
    match oid {
        oid if oid == OID_C => "C",
        oid if oid == OID_ST => "ST",
        oid if oid == OID_L => "L",
        oid if oid == OID_O => "O",
        oid if oid == OID_OU => "OU",
        _ => "CN",
    }
}

fn decode_string(value: &Any) -> Result<String, InvalidDn> {
    match value.tag() {
        Tag::Utf8String | Tag::PrintableString | Tag::Ia5String | Tag::TeletexString => {
            String::from_utf8(value.value().to_vec())
                .map_err(|_| InvalidDn("attribute value is not valid UTF-8".into()))
        },
        other => Err(InvalidDn(format!("unsupported attribute encoding {other}"))),
    }
}

fn split_unescaped(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for c in input.chars() {
        match c {
            ',' if !escaped => parts.push(std::mem::take(&mut current)),
            _ => {
                escaped = c == '\\' && !escaped;
                current.push(c);
            },
        }
    }
    parts.push(current);
    parts
}
