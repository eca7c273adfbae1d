//! Consensus state queries: prevote voting power and round state.

use serde::Deserialize;

use crate::{ChainClient, ChainClientError};

/// Voting-power summary of the current consensus round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrevoteInfo {
    pub height: i64,
    pub round: i64,
    pub step: u8,
    pub online_vp: i64,
    pub total_vp: i64,
}

/// The `round_state` object of the CometBFT `/consensus_state` endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct RoundState {
    #[serde(rename = "height/round/step")]
    pub height_round_step: String,
    #[serde(default)]
    pub height_vote_set: Vec<VoteSet>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VoteSet {
    #[serde(default)]
    pub round: i64,
    #[serde(default)]
    pub prevotes: Vec<String>,
    #[serde(default)]
    pub prevotes_bit_array: String,
}

impl RoundState {
    /// Parse `height/round/step`, e.g. `"1234/0/3"`.
    pub fn height_round_step(&self) -> Result<(i64, i64, u8), ChainClientError> {
        let parts: Vec<&str> = self.height_round_step.split('/').collect();
        if parts.len() != 3 {
            return Err(ChainClientError::parse(format!(
                "failed to parse height/round/step={}",
                self.height_round_step
            )));
        }
        let height = parts[0]
            .parse()
            .map_err(|_| ChainClientError::parse(format!("failed to parse height={}", parts[0])))?;
        let round = parts[1]
            .parse()
            .map_err(|_| ChainClientError::parse(format!("failed to parse round={}", parts[1])))?;
        let step = parts[2]
            .parse()
            .map_err(|_| ChainClientError::parse(format!("failed to parse step={}", parts[2])))?;
        Ok((height, round, step))
    }
}

impl ChainClient {
    /// Fetch the raw round state.
    ///
    /// `/consensus_state` is used rather than `/dump_consensus_state`: the
    /// dump endpoint shows nil-votes for every prevote on several CometBFT
    /// versions, while this route reliably carries the prevote strings.
    pub async fn round_state(&self) -> Result<RoundState, ChainClientError> {
        #[derive(Deserialize)]
        struct ConsensusResult {
            round_state: RoundState,
        }
        #[derive(Deserialize)]
        struct ConsensusResponse {
            result: ConsensusResult,
        }

        let url = self.rpc_url("/consensus_state");
        let response: ConsensusResponse = self.get_json(url).await?;
        Ok(response.result.round_state)
    }

    /// Summarize the current round's prevote voting power.
    pub async fn prevote_info(&self) -> Result<PrevoteInfo, ChainClientError> {
        let round_state = self.round_state().await?;
        let (height, round, step) = round_state.height_round_step()?;

        let vote_set = round_state
            .height_vote_set
            .get(usize::try_from(round).unwrap_or(usize::MAX))
            .ok_or_else(|| {
                ChainClientError::parse(format!(
                    "len(height_vote_set)={} <= round={round}",
                    round_state.height_vote_set.len()
                ))
            })?;

        let (online_vp, total_vp) = parse_prevotes_bit_array(&vote_set.prevotes_bit_array)?;
        Ok(PrevoteInfo { height, round, step, online_vp, total_vp })
    }
}

/// Extract `online/total` voting power from a prevotes bit array such as
/// `BA{100:_____x____} 1906/151215484 = 0.00`.
fn parse_prevotes_bit_array(raw: &str) -> Result<(i64, i64), ChainClientError> {
    let parts: Vec<&str> = raw.split(' ').collect();
    if parts.len() != 4 {
        return Err(ChainClientError::parse(format!(
            "unrecognized prevotes_bit_array format: {raw}"
        )));
    }
    let ratio: Vec<&str> = parts[1].split('/').collect();
    if ratio.len() != 2 {
        return Err(ChainClientError::parse(format!(
            "unrecognized prevotes_bit_array format: {raw}"
        )));
    }
    let online = ratio[0]
        .parse()
        .map_err(|_| ChainClientError::parse(format!("failed to parse online vp={}", ratio[0])))?;
    let total = ratio[1]
        .parse()
        .map_err(|_| ChainClientError::parse(format!("failed to parse total vp={}", ratio[1])))?;
    Ok((online, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prevotes_bit_array() {
        let raw = "BA{100:____________________} 1906/151215484 = 0.00";
        assert_eq!(parse_prevotes_bit_array(raw).unwrap(), (1906, 151215484));
    }

    #[test]
    fn rejects_malformed_bit_array() {
        assert!(parse_prevotes_bit_array("BA{100:___}").is_err());
        assert!(parse_prevotes_bit_array("BA{100:___} garbage = 0.00").is_err());
    }

    #[test]
    fn parses_height_round_step() {
        let state = RoundState {
            height_round_step: "1234/1/3".to_owned(),
            height_vote_set: vec![],
        };
        assert_eq!(state.height_round_step().unwrap(), (1234, 1, 3));

        let bad = RoundState { height_round_step: "1234".to_owned(), height_vote_set: vec![] };
        assert!(bad.height_round_step().is_err());
    }

    #[test]
    fn round_state_decodes_from_rpc_json() {
        let raw = serde_json::json!({
            "height/round/step": "12/0/1",
            "start_time": "2024-01-01T00:00:00Z",
            "proposal_block_hash": "",
            "height_vote_set": [{
                "round": 0,
                "prevotes": ["nil-Vote", "Vote{0:8FA3A9966F20 12/0/SIGNED_MSG_TYPE_PREVOTE(Prevote) ...}"],
                "prevotes_bit_array": "BA{2:_x} 10/20 = 0.50",
                "precommits": [],
                "precommits_bit_array": "BA{2:__} 0/20 = 0.00"
            }],
            "proposer": {"address": "", "index": 0}
        });
        let state: RoundState = serde_json::from_value(raw).unwrap();
        assert_eq!(state.height_vote_set[0].prevotes.len(), 2);
    }
}
