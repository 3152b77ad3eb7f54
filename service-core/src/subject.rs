//! Polymorphic grant subjects: `u:<id>`, `g:<id>` or `m:<id>`.

use crate::uid::{Id, ParseIdError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef, Postgres};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseSubjectError {
    #[error("invalid subject {0:?}: expected a u:, g: or m: prefix")]
    UnknownKind(String),
    #[error("invalid subject id: {0}")]
    InvalidId(#[from] ParseIdError),
    #[error("invalid subject: missing id")]
    MissingId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {
    User(Id),
    Group(Id),
    Machine(Id),
}

impl Subject {
    pub fn id(&self) -> Id {
        match self {
            Subject::User(id) | Subject::Group(id) | Subject::Machine(id) => *id,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Subject::User(_) => "u",
            Subject::Group(_) => "g",
            Subject::Machine(_) => "m",
        }
    }

    /// Identities and machines both resolve to an identity row.
    pub fn identity_id(&self) -> Option<Id> {
        match self {
            Subject::User(id) | Subject::Machine(id) => Some(*id),
            Subject::Group(_) => None,
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseSubjectError> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ParseSubjectError::UnknownKind(s.to_string()))?;
        let parse_id = |raw: &str| -> Result<Id, ParseSubjectError> {
            let id = Id::parse(raw)?;
            if id.is_zero() {
                return Err(ParseSubjectError::MissingId);
            }
            Ok(id)
        };
        match kind {
            "u" => Ok(Subject::User(parse_id(id)?)),
            "g" => Ok(Subject::Group(parse_id(id)?)),
            "m" => Ok(Subject::Machine(parse_id(id)?)),
            _ => Err(ParseSubjectError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix(), self.id())
    }
}

impl FromStr for Subject {
    type Err = ParseSubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Subject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Subject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Subject::parse(&s).map_err(serde::de::Error::custom)
    }
}

// Stored as TEXT in the prefixed form.
impl sqlx::Type<Postgres> for Subject {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <String as sqlx::Type<Postgres>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, Postgres> for Subject {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        <String as sqlx::Encode<'q, Postgres>>::encode_by_ref(&self.to_string(), buf)
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for Subject {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <&str as sqlx::Decode<'r, Postgres>>::decode(value)?;
        Ok(Subject::parse(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_text() {
        let id = Id::from_i64(12345);
        for subject in [Subject::User(id), Subject::Group(id), Subject::Machine(id)] {
            assert_eq!(Subject::parse(&subject.to_string()).unwrap(), subject);
        }
    }

    #[test]
    fn rejects_unknown_prefix() {
        assert!(matches!(
            Subject::parse("x:2"),
            Err(ParseSubjectError::UnknownKind(_))
        ));
        assert!(matches!(
            Subject::parse("2"),
            Err(ParseSubjectError::UnknownKind(_))
        ));
    }

    #[test]
    fn rejects_empty_or_bad_id() {
        assert_eq!(Subject::parse("u:"), Err(ParseSubjectError::MissingId));
        assert!(matches!(
            Subject::parse("g:10"),
            Err(ParseSubjectError::InvalidId(_))
        ));
    }

    #[test]
    fn groups_have_no_identity() {
        assert_eq!(Subject::Group(Id::from_i64(9)).identity_id(), None);
        assert_eq!(
            Subject::Machine(Id::from_i64(9)).identity_id(),
            Some(Id::from_i64(9))
        );
    }
}
