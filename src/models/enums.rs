use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Enum stored as text: `as_str` for writes, `FromStr` for reads.
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(DraftStatus {
    Draft => "DRAFT",
    Validated => "VALIDATED",
});

str_enum!(SemanticNodeType {
    Symptom => "SYMPTOM",
    Diagnosis => "DIAGNOSIS",
    Medication => "MEDICATION",
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn draft_status_round_trips_through_text() {
        assert_eq!(DraftStatus::from_str("DRAFT").unwrap(), DraftStatus::Draft);
        assert_eq!(DraftStatus::Validated.as_str(), "VALIDATED");
        assert_eq!(
            serde_json::to_string(&DraftStatus::Validated).unwrap(),
            "\"VALIDATED\""
        );
    }

    #[test]
    fn unknown_value_is_invalid_enum() {
        let err = SemanticNodeType::from_str("ALLERGY").unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidEnum { ref field, .. } if field == "SemanticNodeType"));
    }
}
