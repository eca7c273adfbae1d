//! The persisted form of the upgrade state machine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{CheckStatus, PostCheck, PreCheck, UpgradeStatus, UpgradeStep};

/// Snapshot of the state machine, keyed by upgrade height.
///
/// Stored as part of the local provider's JSON document. Heights are
/// serialized as strings because JSON object keys are strings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    #[serde(default, with = "height_keyed")]
    pub status: HashMap<i64, UpgradeStatus>,
    #[serde(default, with = "height_keyed")]
    pub steps: HashMap<i64, UpgradeStep>,
    #[serde(default, with = "height_keyed")]
    pub pre_check_status: HashMap<i64, HashMap<PreCheck, CheckStatus>>,
    #[serde(default, with = "height_keyed")]
    pub post_check_status: HashMap<i64, HashMap<PostCheck, CheckStatus>>,
}

/// Serialize `HashMap<i64, V>` with string keys.
mod height_keyed {
    use std::collections::HashMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

    pub(super) fn serialize<S, V>(
        map: &HashMap<i64, V>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        serializer.collect_map(map.iter().map(|(height, value)| (height.to_string(), value)))
    }

    pub(super) fn deserialize<'de, D, V>(deserializer: D) -> Result<HashMap<i64, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        let raw = HashMap::<String, V>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, value)| {
                let height = key
                    .parse::<i64>()
                    .map_err(|_| D::Error::custom(format!("invalid height key `{key}`")))?;
                Ok((height, value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrips_through_json() {
        let mut state = MachineState::default();
        state.status.insert(10, UpgradeStatus::Active);
        state.steps.insert(10, UpgradeStep::Monitoring);
        state
            .pre_check_status
            .entry(10)
            .or_default()
            .insert(PreCheck::PullDockerImage, CheckStatus::Finished);
        state
            .post_check_status
            .entry(10)
            .or_default()
            .insert(PostCheck::GrpcResponsive, CheckStatus::Running);

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"10\""), "heights must be string keys: {json}");

        let back: MachineState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn missing_maps_default_to_empty() {
        let state: MachineState = serde_json::from_str("{}").unwrap();
        assert!(state.status.is_empty());
        assert!(state.post_check_status.is_empty());
    }
}
