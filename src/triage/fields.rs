//! Closed-vocabulary triage fields and their parsing from a model-written JSON object.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::{AppError, AppResult};

/// Declares a closed vocabulary: the enum, its wire strings and severity ranks.
macro_rules! vocabulary {
    ($(#[$meta:meta])* $name:ident, $field:literal { $($variant:ident => ($text:literal, $rank:literal)),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            /// Severity rank on the 0 to 5 scale.
            pub fn rank(&self) -> u8 {
                match self {
                    $($name::$variant => $rank),+
                }
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().to_lowercase();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == wanted)
                    .ok_or_else(|| {
                        AppError::Validation(format!(
                            "'{}' is not a valid {} (expected one of: {})",
                            s,
                            $field,
                            $name::ALL.iter().map(|v| v.as_str()).collect::<Vec<_>>().join(", ")
                        ))
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }
    };
}

vocabulary!(
    /// Kind of emergency.
    Event, "event" {
        Shooting => ("shooting", 5),
        Stabbing => ("stabbing", 4),
        Assault => ("assault", 3),
        DomesticViolence => ("domestic violence", 3),
        SexualAssault => ("sexual assault", 4),
        Robbery => ("robbery", 3),
        MedicalEmergency => ("medical emergency", 5),
        Fire => ("fire", 5),
        TrafficAccident => ("traffic accident", 3),
        NaturalDisaster => ("natural disaster", 5),
        Hazard => ("hazard", 4),
        AnimalIncident => ("animal incident", 2),
        MissingPerson => ("missing person", 1),
        PublicDisturbance => ("public disturbance", 2),
    }
);

vocabulary!(
    /// Most severe injury reported.
    Injury, "injuries value" {
        Unresponsive => ("unresponsive", 5),
        CriticalBleeding => ("critical bleeding", 5),
        SevereBurns => ("severe burns", 5),
        BrokenBones => ("broken bones", 4),
        MinorBleeding => ("minor bleeding", 3),
        MinorInjury => ("minor injury", 2),
        None => ("none", 0),
    }
);

vocabulary!(
    /// Weapon involved, `unknown` when one exists but its type is unclear.
    Weapon, "weapon" {
        Firearm => ("firearm", 5),
        Explosive => ("explosive", 5),
        HazardousMaterial => ("hazardous_material", 5),
        Blade => ("blade", 4),
        BluntObject => ("blunt object", 3),
        Chemical => ("chemical", 4),
        Unknown => ("unknown", 2),
        None => ("none", 0),
    }
);

/// Marker the model writes when nothing is in progress.
pub const NOT_ONGOING: &str = "not ongoing";

/// Whether people are still at risk; anything but "not ongoing" is a description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OngoingThreat {
    NotOngoing,
    Ongoing(String),
}

impl OngoingThreat {
    pub fn parse(text: &str) -> Self {
        if text == NOT_ONGOING {
            OngoingThreat::NotOngoing
        } else {
            OngoingThreat::Ongoing(text.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OngoingThreat::NotOngoing => NOT_ONGOING,
            OngoingThreat::Ongoing(description) => description,
        }
    }

    pub fn is_ongoing(&self) -> bool {
        matches!(self, OngoingThreat::Ongoing(_))
    }
}

impl Serialize for OngoingThreat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Structured description of one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriageFields {
    pub event: Event,
    pub victims: u32,
    pub injuries: Injury,
    pub weapon: Weapon,
    pub ongoing_threat: OngoingThreat,
}

impl TriageFields {
    /// Parse the JSON object the language model committed.
    ///
    /// ## Errors:
    /// - **Extraction**: not JSON, not an object, or a field missing / of the wrong type
    /// - **Validation**: a categorical value outside its vocabulary, or negative victims
    pub fn from_json(text: &str) -> AppResult<Self> {
        let value: Value = serde_json::from_str(strip_code_fence(text))
            .map_err(|e| AppError::Extraction(format!("Committed object is not valid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> AppResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| AppError::Extraction("Committed value is not a JSON object".to_string()))?;

        let text_field = |name: &str| -> AppResult<&str> {
            object
                .get(name)
                .ok_or_else(|| AppError::Extraction(format!("Committed object has no '{}' field", name)))?
                .as_str()
                .ok_or_else(|| AppError::Extraction(format!("Field '{}' must be a string", name)))
        };

        Ok(Self {
            event: text_field("event")?.parse()?,
            victims: parse_victims(object.get("victims"))?,
            injuries: text_field("injuries")?.parse()?,
            weapon: text_field("weapon")?.parse()?,
            ongoing_threat: OngoingThreat::parse(text_field("ongoing_threat")?),
        })
    }
}

/// Victim counts arrive as integers or numeric strings.
fn parse_victims(value: Option<&Value>) -> AppResult<u32> {
    let value = value.ok_or_else(|| AppError::Extraction("Committed object has no 'victims' field".to_string()))?;
    let count = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| AppError::Extraction(format!("Field 'victims' must be an integer, got {}", value)))?;

    u32::try_from(count).map_err(|_| AppError::Validation(format!("Victim count {} is out of range", count)))
}

/// Models sometimes wrap the object in a markdown code fence.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocabulary_sizes() {
        assert_eq!(Event::ALL.len(), 14);
        assert_eq!(Injury::ALL.len(), 7);
        assert_eq!(Weapon::ALL.len(), 8);
    }

    #[test]
    fn test_parse_is_case_and_space_tolerant() {
        assert_eq!(" Domestic Violence ".parse::<Event>().unwrap(), Event::DomesticViolence);
        assert_eq!("hazardous_material".parse::<Weapon>().unwrap(), Weapon::HazardousMaterial);
    }

    #[test]
    fn test_out_of_vocabulary_is_validation_error() {
        assert!(matches!("parade".parse::<Event>(), Err(AppError::Validation(_))));
        assert!(matches!("unknown".parse::<Injury>(), Err(AppError::Validation(_))));
        assert!(matches!("gunshot, unresponsive".parse::<Injury>(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_from_json() {
        let fields = TriageFields::from_json(
            r#"{"event": "shooting", "victims": 1, "injuries": "unresponsive", "weapon": "firearm", "ongoing_threat": "shooter fled"}"#,
        )
        .unwrap();
        assert_eq!(fields.event, Event::Shooting);
        assert_eq!(fields.victims, 1);
        assert!(fields.ongoing_threat.is_ongoing());

        let json = serde_json::to_value(&fields).unwrap();
        assert_eq!(json["event"], "shooting");
        assert_eq!(json["ongoing_threat"], "shooter fled");
    }

    #[test]
    fn test_from_json_accepts_fenced_and_string_victims() {
        let fields = TriageFields::from_json(
            "```json\n{\"event\": \"fire\", \"victims\": \"3\", \"injuries\": \"severe burns\", \"weapon\": \"none\", \"ongoing_threat\": \"not ongoing\"}\n```",
        )
        .unwrap();
        assert_eq!(fields.victims, 3);
        assert_eq!(fields.ongoing_threat, OngoingThreat::NotOngoing);
    }

    #[test]
    fn test_from_json_error_kinds() {
        assert!(matches!(TriageFields::from_json("not json"), Err(AppError::Extraction(_))));
        assert!(matches!(TriageFields::from_json("[1, 2]"), Err(AppError::Extraction(_))));
        assert!(matches!(
            TriageFields::from_json(r#"{"event": "fire", "victims": 1}"#),
            Err(AppError::Extraction(_))
        ));
        assert!(matches!(
            TriageFields::from_json(
                r#"{"event": "fire", "victims": -2, "injuries": "none", "weapon": "none", "ongoing_threat": "not ongoing"}"#
            ),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            TriageFields::from_json(
                r#"{"event": "fire", "victims": 1, "injuries": "none", "weapon": "spoon", "ongoing_threat": "not ongoing"}"#
            ),
            Err(AppError::Validation(_))
        ));
    }
}
