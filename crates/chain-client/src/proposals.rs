//! Governance proposal queries against the node's REST API.
//!
//! Both the `v1` and the legacy `v1beta1` shapes are supported. Message and
//! content payloads are kept as raw JSON; the chain provider decodes the two
//! software-upgrade message types it understands and ignores the rest.

use serde::Deserialize;
use serde_json::Value;

use crate::{ChainClient, ChainClientError};

const PAGINATION_LIMIT: u32 = 100;

/// A governance proposal from `/cosmos/gov/v1/proposals`.
#[derive(Clone, Debug, Deserialize)]
pub struct ProposalV1 {
    #[serde(with = "string_i64")]
    pub id: i64,
    pub status: String,
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// A governance proposal from `/cosmos/gov/v1beta1/proposals`.
#[derive(Clone, Debug, Deserialize)]
pub struct ProposalV1Beta1 {
    #[serde(with = "string_i64")]
    pub proposal_id: i64,
    pub status: String,
    #[serde(default)]
    pub content: Value,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    next_key: Option<String>,
}

impl ChainClient {
    /// All proposals from the v1 governance endpoint, fully paginated.
    pub async fn proposals_v1(&self) -> Result<Vec<ProposalV1>, ChainClientError> {
        #[derive(Deserialize)]
        struct Page {
            #[serde(default)]
            proposals: Vec<ProposalV1>,
            #[serde(default)]
            pagination: Option<Pagination>,
        }

        let mut proposals = Vec::new();
        let mut next_key: Option<String> = None;
        loop {
            let mut url = self.api_url("/cosmos/gov/v1/proposals");
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("pagination.limit", &PAGINATION_LIMIT.to_string());
                if let Some(key) = &next_key {
                    query.append_pair("pagination.key", key);
                }
            }
            let page: Page = self.get_json(url).await?;
            proposals.extend(page.proposals);
            next_key = page.pagination.and_then(|p| p.next_key).filter(|k| !k.is_empty());
            if next_key.is_none() {
                break;
            }
        }
        Ok(proposals)
    }

    /// All proposals from the legacy v1beta1 governance endpoint.
    pub async fn proposals_v1beta1(&self) -> Result<Vec<ProposalV1Beta1>, ChainClientError> {
        #[derive(Deserialize)]
        struct Page {
            #[serde(default)]
            proposals: Vec<ProposalV1Beta1>,
            #[serde(default)]
            pagination: Option<Pagination>,
        }

        let mut proposals = Vec::new();
        let mut next_key: Option<String> = None;
        loop {
            let mut url = self.api_url("/cosmos/gov/v1beta1/proposals");
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("pagination.limit", &PAGINATION_LIMIT.to_string());
                if let Some(key) = &next_key {
                    query.append_pair("pagination.key", key);
                }
            }
            let page: Page = self.get_json(url).await?;
            proposals.extend(page.proposals);
            next_key = page.pagination.and_then(|p| p.next_key).filter(|k| !k.is_empty());
            if next_key.is_none() {
                break;
            }
        }
        Ok(proposals)
    }
}

/// Cosmos REST encodes int64 values as JSON strings; accept both forms.
pub mod string_i64 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(value),
            Raw::Text(text) => text
                .parse()
                .map_err(|_| D::Error::custom(format!("invalid int64 string `{text}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_proposal_decodes_from_rest_json() {
        let raw = serde_json::json!({
            "id": "12",
            "status": "PROPOSAL_STATUS_PASSED",
            "messages": [{
                "@type": "/cosmos.upgrade.v1beta1.MsgSoftwareUpgrade",
                "authority": "cosmos10d07y265gmmuvt4z0w9aw880jnsr700j6zn9kn",
                "plan": {"name": "v2", "height": "10", "info": ""}
            }]
        });
        let proposal: ProposalV1 = serde_json::from_value(raw).unwrap();
        assert_eq!(proposal.id, 12);
        assert_eq!(proposal.status, "PROPOSAL_STATUS_PASSED");
        assert_eq!(proposal.messages.len(), 1);
    }

    #[test]
    fn v1beta1_proposal_decodes_from_rest_json() {
        let raw = serde_json::json!({
            "proposal_id": 7,
            "status": "PROPOSAL_STATUS_VOTING_PERIOD",
            "content": {
                "@type": "/cosmos.upgrade.v1beta1.SoftwareUpgradeProposal",
                "title": "upgrade",
                "plan": {"name": "v3", "height": "20"}
            }
        });
        let proposal: ProposalV1Beta1 = serde_json::from_value(raw).unwrap();
        assert_eq!(proposal.proposal_id, 7);
        assert_eq!(proposal.content["plan"]["name"], "v3");
    }
}
