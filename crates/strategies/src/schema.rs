//! The wire schema of a strategy, exactly as an external editor submits it.
//!
//! Every field is optional at this level so that validation can report all
//! problems of a payload at once instead of stopping at the first serde error.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawStrategy {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s1_signal: Option<RawSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o1_cancel: Option<RawSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z1_entry: Option<RawSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ze1_close: Option<RawSection>,
    #[serde(default, alias = "e1", skip_serializing_if = "Option::is_none")]
    pub emergency_exit: Option<RawSection>,
}

impl RawStrategy {
    pub fn from_json(payload: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn from_toml(payload: &str) -> crate::Result<Self> {
        Ok(toml::from_str(payload)?)
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawSection {
    /// "AND" or "OR". Required; there is no implicit combination rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<String>,
    #[serde(default)]
    pub conditions: Vec<RawCondition>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawCondition {
    /// "threshold", "duration" or "sequence".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_on_false: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<RawCondition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gap_seconds: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e1_is_accepted_as_alias_for_emergency_exit() {
        let raw = RawStrategy::from_json(
            r#"{"id":"x","e1":{"logic":"OR","conditions":[]}}"#,
        )
        .unwrap();
        assert_eq!(raw.emergency_exit.unwrap().logic.as_deref(), Some("OR"));
    }

    #[test]
    fn toml_payloads_parse_to_the_same_shape() {
        let raw = RawStrategy::from_toml(
            r#"
            id = "pump"

            [s1_signal]
            logic = "AND"

            [[s1_signal.conditions]]
            kind = "threshold"
            indicator = "pump_magnitude_pct"
            operator = ">"
            value = 5.0
            "#,
        )
        .unwrap();
        let section = raw.s1_signal.unwrap();
        assert_eq!(section.conditions.len(), 1);
        assert_eq!(section.conditions[0].operator.as_deref(), Some(">"));
    }

    #[test]
    fn unset_fields_are_not_serialised() {
        let raw = RawStrategy { id: "only-id".into(), ..Default::default() };
        assert_eq!(serde_json::to_string(&raw).unwrap(), r#"{"id":"only-id"}"#);
    }
}
