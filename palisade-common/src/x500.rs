//! X.500 legal names.
//!
//! A [`LegalName`] is the canonical identity of a node in the compatibility
//! zone. It is embedded as the Subject of every certificate the node holds or
//! issues, seeds its credential store aliases, and is what a peer channel's
//! allow-list is matched against.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

/// The maximum number of characters allowed in any single attribute value.
const MAX_ATTRIBUTE_LENGTH: usize = 128;

/// An X.500 distinguished name with the attribute set used by the
/// compatibility zone: mandatory organisation (O), locality (L), and
/// country (C), plus optional organisational unit (OU), common name (CN),
/// and state (ST).
///
/// The canonical string form is e.g. `"O=Alice Corp, L=Madrid, C=ES"`, with
/// any optional attributes appended in `OU`, `CN`, `ST` order. Parsing
/// accepts attributes in any order but rejects duplicates and unknown types.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct LegalName {
    organization: String,
    locality: String,
    country: String,
    organizational_unit: Option<String>,
    common_name: Option<String>,
    state: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("attribute '{0}' is missing")]
    MissingAttribute(&'static str),
    #[error("attribute '{0}' appears more than once")]
    DuplicateAttribute(String),
    #[error("unsupported attribute type '{0}'")]
    UnsupportedAttribute(String),
    #[error("attribute '{0}' has an invalid value")]
    InvalidValue(String),
    #[error("country must be two uppercase ASCII letters")]
    InvalidCountry,
    #[error("expected 'TYPE=value' in '{0}'")]
    Malformed(String),
}

impl LegalName {
    /// Build a legal name from the three mandatory attributes.
    pub fn new(
        organization: impl Into<String>,
        locality: impl Into<String>,
        country: impl Into<String>,
    ) -> Result<Self, ParseError> {
        let name = Self {
            organization: organization.into(),
            locality: locality.into(),
            country: country.into(),
            organizational_unit: None,
            common_name: None,
            state: None,
        };
        name.validate()?;
        Ok(name)
    }

    pub fn with_organizational_unit(
        mut self,
        ou: impl Into<String>,
    ) -> Result<Self, ParseError> {
        self.organizational_unit = Some(ou.into());
        self.validate()?;
        Ok(self)
    }

    pub fn with_common_name(
        mut self,
        cn: impl Into<String>,
    ) -> Result<Self, ParseError> {
        self.common_name = Some(cn.into());
        self.validate()?;
        Ok(self)
    }

    pub fn with_state(
        mut self,
        state: impl Into<String>,
    ) -> Result<Self, ParseError> {
        self.state = Some(state.into());
        self.validate()?;
        Ok(self)
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn locality(&self) -> &str {
        &self.locality
    }

    pub fn country(&self) -> &str {
        &self.country
    }

    pub fn organizational_unit(&self) -> Option<&str> {
        self.organizational_unit.as_deref()
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    fn validate(&self) -> Result<(), ParseError> {
        let mandatory = [
            ("O", self.organization.as_str()),
            ("L", self.locality.as_str()),
        ];
        for (ty, value) in mandatory {
            validate_attribute(ty, value)?;
        }
        for (ty, value) in [
            ("OU", self.organizational_unit.as_deref()),
            ("CN", self.common_name.as_deref()),
            ("ST", self.state.as_deref()),
        ] {
            if let Some(value) = value {
                validate_attribute(ty, value)?;
            }
        }

        let c = self.country.as_str();
        if c.len() != 2 || !c.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(ParseError::InvalidCountry);
        }
        Ok(())
    }
}

fn validate_attribute(ty: &str, value: &str) -> Result<(), ParseError> {
    let ok = !value.is_empty()
        && value.len() <= MAX_ATTRIBUTE_LENGTH
        && !value.starts_with(' ')
        && !value.ends_with(' ')
        && value.chars().all(|c| {
            !c.is_control() && c != ',' && c != '=' && c != '$' && c != '"'
        });
    if ok {
        Ok(())
    } else {
        Err(ParseError::InvalidValue(ty.to_owned()))
    }
}

impl Display for LegalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "O={}, L={}, C={}",
            self.organization, self.locality, self.country
        )?;
        if let Some(ou) = &self.organizational_unit {
            write!(f, ", OU={ou}")?;
        }
        if let Some(cn) = &self.common_name {
            write!(f, ", CN={cn}")?;
        }
        if let Some(st) = &self.state {
            write!(f, ", ST={st}")?;
        }
        Ok(())
    }
}

impl FromStr for LegalName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut organization = None;
        let mut locality = None;
        let mut country = None;
        let mut organizational_unit = None;
        let mut common_name = None;
        let mut state = None;

        for part in s.split(',') {
            let part = part.trim();
            let (ty, value) = part
                .split_once('=')
                .ok_or_else(|| ParseError::Malformed(part.to_owned()))?;
            let (ty, value) = (ty.trim(), value.trim().to_owned());
            let slot = match ty {
                "O" => &mut organization,
                "L" => &mut locality,
                "C" => &mut country,
                "OU" => &mut organizational_unit,
                "CN" => &mut common_name,
                "ST" | "S" => &mut state,
                other =>
                    return Err(ParseError::UnsupportedAttribute(
                        other.to_owned(),
                    )),
            };
            if slot.replace(value).is_some() {
                return Err(ParseError::DuplicateAttribute(ty.to_owned()));
            }
        }

        let name = Self {
            organization: organization
                .ok_or(ParseError::MissingAttribute("O"))?,
            locality: locality.ok_or(ParseError::MissingAttribute("L"))?,
            country: country.ok_or(ParseError::MissingAttribute("C"))?,
            organizational_unit,
            common_name,
            state,
        };
        name.validate()?;
        Ok(name)
    }
}

impl Serialize for LegalName {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LegalName {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}
