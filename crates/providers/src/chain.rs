//! Upgrades scraped from on-chain governance proposals.
//!
//! The provider understands exactly two message shapes: the legacy
//! `SoftwareUpgradeProposal` (possibly wrapped in `MsgExecLegacyContent`) and
//! the newer `MsgSoftwareUpgrade`. Everything else a proposal may carry is
//! ignored. The v1 governance endpoint is tried first with a fallback to
//! v1beta1 for older chains.

use helmsman_chain_client::{ChainClient, string_i64};
use helmsman_types::{ProviderKind, Upgrade, UpgradeStatus, UpgradeType};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{ProviderError, post_process_upgrade};

const LEGACY_CONTENT_URL: &str = "/cosmos.gov.v1.MsgExecLegacyContent";
const SOFTWARE_UPGRADE_PROPOSAL_URL: &str = "/cosmos.upgrade.v1beta1.SoftwareUpgradeProposal";
const MSG_SOFTWARE_UPGRADE_URL: &str = "/cosmos.upgrade.v1beta1.MsgSoftwareUpgrade";

/// Governance proposal status, collapsed across the v1/v1beta1 wire names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProposalStatus {
    Unknown,
    Unspecified,
    DepositPeriod,
    VotingPeriod,
    Passed,
    Rejected,
    Failed,
}

impl ProposalStatus {
    fn from_wire(name: &str) -> Self {
        match name {
            "PROPOSAL_STATUS_UNSPECIFIED" => ProposalStatus::Unspecified,
            "PROPOSAL_STATUS_DEPOSIT_PERIOD" => ProposalStatus::DepositPeriod,
            "PROPOSAL_STATUS_VOTING_PERIOD" => ProposalStatus::VotingPeriod,
            "PROPOSAL_STATUS_PASSED" => ProposalStatus::Passed,
            "PROPOSAL_STATUS_REJECTED" => ProposalStatus::Rejected,
            "PROPOSAL_STATUS_FAILED" => ProposalStatus::Failed,
            _ => ProposalStatus::Unknown,
        }
    }

    fn to_upgrade_status(self) -> UpgradeStatus {
        match self {
            ProposalStatus::Unknown | ProposalStatus::Unspecified => UpgradeStatus::Unknown,
            ProposalStatus::DepositPeriod | ProposalStatus::VotingPeriod => {
                UpgradeStatus::Scheduled
            }
            ProposalStatus::Passed => UpgradeStatus::Active,
            ProposalStatus::Rejected | ProposalStatus::Failed => UpgradeStatus::Cancelled,
        }
    }
}

/// An upgrade plan extracted from a proposal, before conversion to the
/// registry model.
#[derive(Clone, Debug)]
struct ChainUpgrade {
    height: i64,
    name: String,
    status: ProposalStatus,
    proposal_id: i64,
}

#[derive(Debug)]
pub struct ChainProvider {
    client: ChainClient,
    network: String,
    priority: i32,
}

impl ChainProvider {
    pub fn new(client: ChainClient, network: impl Into<String>, priority: i32) -> Self {
        Self { client, network: network.into(), priority }
    }

    pub async fn get_upgrades(&self) -> Result<Vec<Upgrade>, ProviderError> {
        let upgrades = self.fetch_all_upgrades().await?;
        Ok(self.reconcile(upgrades))
    }

    async fn fetch_all_upgrades(&self) -> Result<Vec<ChainUpgrade>, ProviderError> {
        match self.proposals_v1().await {
            Ok(upgrades) => Ok(upgrades),
            Err(v1_err) => {
                debug!(error = %v1_err, "v1 governance endpoint failed, trying v1beta1");
                self.proposals_v1beta1().await.map_err(|v1beta1_err| {
                    ProviderError::Invalid(format!(
                        "failed to scrape upgrade proposals from both v1 ({v1_err}) and \
                         v1beta1 ({v1beta1_err}) endpoints"
                    ))
                })
            }
        }
    }

    async fn proposals_v1(&self) -> Result<Vec<ChainUpgrade>, ProviderError> {
        let proposals = self.client.proposals_v1().await?;
        let mut upgrades = Vec::new();
        for proposal in proposals {
            let status = ProposalStatus::from_wire(&proposal.status);
            if matches!(status, ProposalStatus::Rejected | ProposalStatus::Failed) {
                continue;
            }
            for message in &proposal.messages {
                let (type_url, content) = unwrap_legacy_content(message)?;
                if let Some(upgrade) = parse_plan_message(type_url, content, status, proposal.id)? {
                    upgrades.push(upgrade);
                }
            }
        }
        Ok(upgrades)
    }

    async fn proposals_v1beta1(&self) -> Result<Vec<ChainUpgrade>, ProviderError> {
        let proposals = self.client.proposals_v1beta1().await?;
        let mut upgrades = Vec::new();
        for proposal in proposals {
            let status = ProposalStatus::from_wire(&proposal.status);
            if matches!(status, ProposalStatus::Rejected | ProposalStatus::Failed) {
                continue;
            }
            let type_url = proposal.content.get("@type").and_then(Value::as_str).unwrap_or("");
            if let Some(upgrade) =
                parse_plan_message(type_url, &proposal.content, status, proposal.proposal_id)?
            {
                upgrades.push(upgrade);
            }
        }
        Ok(upgrades)
    }

    /// Apply the cosmos-sdk plan-overwrite semantics and convert to the
    /// registry model.
    ///
    /// A later proposal with the same plan name replaces the earlier one.
    /// When several passed proposals target the same height only the one
    /// with the highest proposal id is still scheduled on chain; the
    /// overwritten ones are kept as cancelled records, each at its own
    /// priority so the `(height, priority)` key stays unique.
    fn reconcile(&self, mut upgrades: Vec<ChainUpgrade>) -> Vec<Upgrade> {
        upgrades.sort_by(|a, b| b.proposal_id.cmp(&a.proposal_id));

        let mut passed_names = std::collections::HashSet::new();
        let mut height_ranks: std::collections::HashMap<i64, i32> = std::collections::HashMap::new();
        let mut reconciled = Vec::with_capacity(upgrades.len());
        for upgrade in upgrades {
            if passed_names.contains(&upgrade.name) {
                continue;
            }
            if upgrade.status == ProposalStatus::Passed {
                passed_names.insert(upgrade.name.clone());
            }

            let rank = height_ranks
                .entry(upgrade.height)
                .and_modify(|rank| *rank += 1)
                .or_insert(0);
            let rank = *rank;

            let mut converted = Upgrade {
                height: upgrade.height,
                tag: String::new(),
                network: self.network.clone(),
                name: upgrade.name,
                upgrade_type: UpgradeType::Governance,
                status: if rank == 0 {
                    upgrade.status.to_upgrade_status()
                } else {
                    UpgradeStatus::Cancelled
                },
                step: Default::default(),
                priority: 0,
                source: ProviderKind::Chain,
                proposal_id: Some(upgrade.proposal_id),
            };
            post_process_upgrade(&mut converted, ProviderKind::Chain, self.priority);
            if rank > 0 {
                // overwritten plans sit below the surviving one so priority
                // resolution keeps the survivor
                converted.priority = self.priority - rank;
            }
            reconciled.push(converted);
        }

        reconciled
    }
}

/// Peel a `MsgExecLegacyContent` wrapper, returning the effective type url
/// and payload.
fn unwrap_legacy_content(message: &Value) -> Result<(&str, &Value), ProviderError> {
    let type_url = message.get("@type").and_then(Value::as_str).unwrap_or("");
    if type_url == LEGACY_CONTENT_URL {
        let content = message.get("content").ok_or_else(|| {
            ProviderError::Invalid("MsgExecLegacyContent without content".to_owned())
        })?;
        let inner_url = content.get("@type").and_then(Value::as_str).unwrap_or("");
        Ok((inner_url, content))
    } else {
        Ok((type_url, message))
    }
}

/// Decode one of the two understood software-upgrade message types; any
/// other content yields `None`.
fn parse_plan_message(
    type_url: &str,
    content: &Value,
    status: ProposalStatus,
    proposal_id: i64,
) -> Result<Option<ChainUpgrade>, ProviderError> {
    if type_url != SOFTWARE_UPGRADE_PROPOSAL_URL && type_url != MSG_SOFTWARE_UPGRADE_URL {
        return Ok(None);
    }

    #[derive(Deserialize)]
    struct PlanRaw {
        name: String,
        #[serde(with = "string_i64")]
        height: i64,
    }
    #[derive(Deserialize)]
    struct WithPlan {
        plan: PlanRaw,
    }

    let with_plan: WithPlan = serde_json::from_value(content.clone()).map_err(|err| {
        ProviderError::Invalid(format!(
            "failed to decode upgrade plan in proposal id {proposal_id}: {err}"
        ))
    })?;

    Ok(Some(ChainUpgrade {
        height: with_plan.plan.height,
        name: with_plan.plan.name,
        status,
        proposal_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_upgrade(height: i64, name: &str, status: ProposalStatus, id: i64) -> ChainUpgrade {
        ChainUpgrade { height, name: name.to_owned(), status, proposal_id: id }
    }

    fn provider() -> ChainProvider {
        let client = ChainClient::new("127.0.0.1", 1317, 26657, std::time::Duration::from_secs(1))
            .unwrap();
        ChainProvider::new(client, "testnet-1", 1)
    }

    #[test]
    fn latest_passed_proposal_wins_per_name() {
        // proposal 2 amends the plan of proposal 1 under the same name
        let reconciled = provider().reconcile(vec![
            chain_upgrade(10, "v2", ProposalStatus::Passed, 1),
            chain_upgrade(15, "v2", ProposalStatus::Passed, 2),
        ]);
        assert_eq!(reconciled.len(), 1);
        assert_eq!(reconciled[0].height, 15);
        assert_eq!(reconciled[0].proposal_id, Some(2));
    }

    #[test]
    fn highest_proposal_id_wins_per_height() {
        let reconciled = provider().reconcile(vec![
            chain_upgrade(10, "v2-alpha", ProposalStatus::Passed, 3),
            chain_upgrade(10, "v2-beta", ProposalStatus::Passed, 5),
        ]);
        assert_eq!(reconciled.len(), 2);

        // the highest proposal id is the one still scheduled on chain
        assert_eq!(reconciled[0].name, "v2-beta");
        assert_eq!(reconciled[0].status, UpgradeStatus::Active);
        assert_eq!(reconciled[0].proposal_id, Some(5));

        // the overwritten plan stays visible as a cancelled record at a
        // distinct priority
        assert_eq!(reconciled[1].name, "v2-alpha");
        assert_eq!(reconciled[1].status, UpgradeStatus::Cancelled);
        assert_eq!(reconciled[1].proposal_id, Some(3));
        assert_ne!(reconciled[0].priority, reconciled[1].priority);
        assert!(reconciled[1].priority < reconciled[0].priority);
    }

    #[test]
    fn voting_period_becomes_scheduled() {
        let reconciled =
            provider().reconcile(vec![chain_upgrade(30, "v3", ProposalStatus::VotingPeriod, 9)]);
        assert_eq!(reconciled[0].status, UpgradeStatus::Scheduled);
        assert_eq!(reconciled[0].upgrade_type, UpgradeType::Governance);
        assert_eq!(reconciled[0].source, ProviderKind::Chain);
        assert_eq!(reconciled[0].priority, 1);
    }

    #[test]
    fn decodes_msg_software_upgrade() {
        let message = serde_json::json!({
            "@type": "/cosmos.upgrade.v1beta1.MsgSoftwareUpgrade",
            "authority": "cosmos10d07y265gmmuvt4z0w9aw880jnsr700j6zn9kn",
            "plan": {"name": "v2", "height": "10", "info": "{}"}
        });
        let (url, content) = unwrap_legacy_content(&message).unwrap();
        let upgrade = parse_plan_message(url, content, ProposalStatus::Passed, 12)
            .unwrap()
            .unwrap();
        assert_eq!(upgrade.height, 10);
        assert_eq!(upgrade.name, "v2");
    }

    #[test]
    fn decodes_legacy_content_wrapper() {
        let message = serde_json::json!({
            "@type": "/cosmos.gov.v1.MsgExecLegacyContent",
            "content": {
                "@type": "/cosmos.upgrade.v1beta1.SoftwareUpgradeProposal",
                "title": "upgrade to v2",
                "plan": {"name": "v2", "height": "10"}
            }
        });
        let (url, content) = unwrap_legacy_content(&message).unwrap();
        assert_eq!(url, SOFTWARE_UPGRADE_PROPOSAL_URL);
        let upgrade = parse_plan_message(url, content, ProposalStatus::Passed, 1)
            .unwrap()
            .unwrap();
        assert_eq!(upgrade.name, "v2");
    }

    #[test]
    fn unrelated_messages_are_ignored() {
        let message = serde_json::json!({
            "@type": "/cosmos.bank.v1beta1.MsgSend",
            "amount": []
        });
        let (url, content) = unwrap_legacy_content(&message).unwrap();
        assert!(parse_plan_message(url, content, ProposalStatus::Passed, 1).unwrap().is_none());
    }
}
