use crate::error::Res;
use anyhow::{ensure, Context};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Twelve per-month amounts, January first. Stored in SQLite and sent to the remote store as
/// JSON text, e.g. `[100,100,100,100,100,100,100,100,100,100,100,250]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MonthlyAmounts([i64; 12]);

impl MonthlyAmounts {
    pub fn new(values: [i64; 12]) -> Self {
        Self(values)
    }

    /// Builds from a slice, which must have exactly 12 elements.
    pub fn from_slice(values: &[i64]) -> Res<Self> {
        ensure!(
            values.len() == 12,
            "Expected 12 monthly amounts but got {}",
            values.len()
        );
        let mut arr = [0i64; 12];
        arr.copy_from_slice(values);
        Ok(Self(arr))
    }

    /// Parses the JSON text representation.
    pub fn from_json(text: &str) -> Res<Self> {
        let values: Vec<i64> = serde_json::from_str(text)
            .with_context(|| format!("Unable to parse monthly amounts '{text}'"))?;
        Self::from_slice(&values)
    }

    /// Parses an optional JSON text column; `NULL` and empty text mean "not present".
    pub(crate) fn from_optional_json(text: Option<&str>) -> Res<Option<Self>> {
        match text.map(str::trim) {
            None | Some("") | Some("null") => Ok(None),
            Some(t) => Self::from_json(t).map(Some),
        }
    }

    pub fn to_json(&self) -> Res<String> {
        serde_json::to_string(&self.0[..]).context("Unable to serialize monthly amounts")
    }

    /// The JSON text column for optional amounts; `None` stays `NULL`.
    pub(crate) fn to_optional_json(amounts: Option<&Self>) -> Res<Option<String>> {
        amounts.map(Self::to_json).transpose()
    }

    /// The amount for `month`, 1 through 12. Out-of-range months are zero.
    pub fn get(&self, month: u8) -> i64 {
        match month {
            1..=12 => self.0[usize::from(month - 1)],
            _ => 0,
        }
    }

    pub fn values(&self) -> &[i64; 12] {
        &self.0
    }

    /// The sum of the twelve amounts, saturating at the bounds of `i64`.
    pub fn total(&self) -> i64 {
        self.0.iter().fold(0, |total, v| total.saturating_add(*v))
    }

    pub fn any_negative(&self) -> bool {
        self.0.iter().any(|v| *v < 0)
    }

    pub fn any_above(&self, max: i64) -> bool {
        self.0.iter().any(|v| *v > max)
    }
}

impl Serialize for MonthlyAmounts {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0[..].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MonthlyAmounts {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let values = Vec::<i64>::deserialize(deserializer)?;
        MonthlyAmounts::from_slice(&values).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json() {
        let m = MonthlyAmounts::from_json("[1,2,3,4,5,6,7,8,9,10,11,12]").unwrap();
        assert_eq!(m.get(1), 1);
        assert_eq!(m.get(12), 12);
        assert_eq!(m.get(13), 0);
        assert_eq!(m.total(), 78);
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        assert!(MonthlyAmounts::from_json("[1,2,3]").is_err());
        assert!(serde_json::from_str::<MonthlyAmounts>("[1,2]").is_err());
    }

    #[test]
    fn test_optional_json() {
        assert_eq!(MonthlyAmounts::from_optional_json(None).unwrap(), None);
        assert_eq!(MonthlyAmounts::from_optional_json(Some("")).unwrap(), None);
        assert_eq!(MonthlyAmounts::from_optional_json(Some("null")).unwrap(), None);
        let m = MonthlyAmounts::from_optional_json(Some("[0,0,0,0,0,0,0,0,0,0,0,5]"))
            .unwrap()
            .unwrap();
        assert_eq!(m.get(12), 5);
    }

    #[test]
    fn test_to_json() {
        let m = MonthlyAmounts::new([5; 12]);
        assert_eq!(m.to_json().unwrap(), "[5,5,5,5,5,5,5,5,5,5,5,5]");
        assert_eq!(MonthlyAmounts::to_optional_json(None).unwrap(), None);
    }

    #[test]
    fn test_total_saturates() {
        let m = MonthlyAmounts::new([i64::MAX / 2; 12]);
        assert_eq!(m.total(), i64::MAX);
        assert!(m.any_above(1));
        assert!(!m.any_negative());
    }
}
