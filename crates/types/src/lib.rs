//! Core data model shared by every helmsman crate.
//!
//! An [`Upgrade`] is an announced node version change scheduled at a specific
//! block height; a [`Version`] maps a height to the container image tag that
//! must run from that height on. Both carry a `(height, network, priority)`
//! composite identity, with the priority used to pick a winner when several
//! providers announce a record for the same height.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub mod state;

pub use state::MachineState;

macro_rules! fmt_as_str {
    () => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    };
}

/// Where an upgrade or version record originated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderKind {
    /// Scraped from on-chain governance proposals. Read only.
    Chain,
    /// Shared relational store, visible to every helmsman instance.
    Database,
    /// JSON document on the local disk, private to this instance.
    #[default]
    Local,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] =
        [ProviderKind::Chain, ProviderKind::Database, ProviderKind::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Chain => "CHAIN",
            ProviderKind::Database => "DATABASE",
            ProviderKind::Local => "LOCAL",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CHAIN" => Ok(ProviderKind::Chain),
            "DATABASE" => Ok(ProviderKind::Database),
            "LOCAL" => Ok(ProviderKind::Local),
            _ => Err(ParseEnumError::new("provider", s)),
        }
    }
}

/// How the upgrade is coordinated across the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpgradeType {
    /// Driven by an on-chain governance proposal; the node halts itself and
    /// writes `upgrade-info.json` at the upgrade height.
    Governance,
    /// No governance proposal, but every validator upgrades at the same
    /// height (enforced locally with a halt-height restart).
    NonGovernanceCoordinated,
    /// No coordination at all; helmsman swaps the image when the height is
    /// reached.
    #[default]
    NonGovernanceUncoordinated,
}

impl UpgradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeType::Governance => "GOVERNANCE",
            UpgradeType::NonGovernanceCoordinated => "NON_GOVERNANCE_COORDINATED",
            UpgradeType::NonGovernanceUncoordinated => "NON_GOVERNANCE_UNCOORDINATED",
        }
    }
}

impl fmt::Display for UpgradeType {
    fmt_as_str!();
}

impl FromStr for UpgradeType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GOVERNANCE" => Ok(UpgradeType::Governance),
            "NON_GOVERNANCE_COORDINATED" => Ok(UpgradeType::NonGovernanceCoordinated),
            "NON_GOVERNANCE_UNCOORDINATED" => Ok(UpgradeType::NonGovernanceUncoordinated),
            _ => Err(ParseEnumError::new("upgrade type", s)),
        }
    }
}

/// Lifecycle status of an upgrade.
///
/// Providers may only ever report `UNKNOWN`, `SCHEDULED`, `ACTIVE` or
/// `CANCELLED`; everything else belongs to the state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpgradeStatus {
    #[default]
    Unknown,
    /// Announced but not yet ready for execution (e.g. proposal in voting).
    Scheduled,
    /// Ready; will be executed when the height is reached.
    Active,
    /// The orchestration loop owns it right now.
    Executing,
    Completed,
    Failed,
    Cancelled,
    /// The chain moved past the height before the upgrade ever executed.
    Expired,
}

impl UpgradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeStatus::Unknown => "UNKNOWN",
            UpgradeStatus::Scheduled => "SCHEDULED",
            UpgradeStatus::Active => "ACTIVE",
            UpgradeStatus::Executing => "EXECUTING",
            UpgradeStatus::Completed => "COMPLETED",
            UpgradeStatus::Failed => "FAILED",
            UpgradeStatus::Cancelled => "CANCELLED",
            UpgradeStatus::Expired => "EXPIRED",
        }
    }

    /// Statuses a provider is allowed to hand to the state machine.
    pub fn is_provider_input(&self) -> bool {
        matches!(
            self,
            UpgradeStatus::Unknown
                | UpgradeStatus::Scheduled
                | UpgradeStatus::Active
                | UpgradeStatus::Cancelled
        )
    }

    /// Statuses owned exclusively by the state machine.
    pub fn is_machine_managed(&self) -> bool {
        matches!(
            self,
            UpgradeStatus::Executing
                | UpgradeStatus::Completed
                | UpgradeStatus::Failed
                | UpgradeStatus::Expired
        )
    }

    /// Terminal statuses are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpgradeStatus::Completed | UpgradeStatus::Failed | UpgradeStatus::Cancelled
        )
    }
}

impl fmt::Display for UpgradeStatus {
    fmt_as_str!();
}

impl FromStr for UpgradeStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(UpgradeStatus::Unknown),
            "SCHEDULED" => Ok(UpgradeStatus::Scheduled),
            "ACTIVE" => Ok(UpgradeStatus::Active),
            "EXECUTING" => Ok(UpgradeStatus::Executing),
            "COMPLETED" => Ok(UpgradeStatus::Completed),
            "FAILED" => Ok(UpgradeStatus::Failed),
            "CANCELLED" => Ok(UpgradeStatus::Cancelled),
            "EXPIRED" => Ok(UpgradeStatus::Expired),
            _ => Err(ParseEnumError::new("upgrade status", s)),
        }
    }
}

/// Execution step, orthogonal to [`UpgradeStatus`] and advanced while the
/// upgrade is `EXECUTING`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpgradeStep {
    #[default]
    None,
    Monitoring,
    PreUpgradeCheck,
    ComposeFileUpgrade,
    PostUpgradeCheck,
}

impl UpgradeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeStep::None => "NONE",
            UpgradeStep::Monitoring => "MONITORING",
            UpgradeStep::PreUpgradeCheck => "PRE_UPGRADE_CHECK",
            UpgradeStep::ComposeFileUpgrade => "COMPOSE_FILE_UPGRADE",
            UpgradeStep::PostUpgradeCheck => "POST_UPGRADE_CHECK",
        }
    }
}

impl fmt::Display for UpgradeStep {
    fmt_as_str!();
}

impl FromStr for UpgradeStep {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(UpgradeStep::None),
            "MONITORING" => Ok(UpgradeStep::Monitoring),
            "PRE_UPGRADE_CHECK" => Ok(UpgradeStep::PreUpgradeCheck),
            "COMPOSE_FILE_UPGRADE" => Ok(UpgradeStep::ComposeFileUpgrade),
            "POST_UPGRADE_CHECK" => Ok(UpgradeStep::PostUpgradeCheck),
            _ => Err(ParseEnumError::new("upgrade step", s)),
        }
    }
}

/// Verifications run before the container switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreCheck {
    PullDockerImage,
    SetHaltHeight,
}

impl PreCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreCheck::PullDockerImage => "PULL_DOCKER_IMAGE",
            PreCheck::SetHaltHeight => "SET_HALT_HEIGHT",
        }
    }
}

impl fmt::Display for PreCheck {
    fmt_as_str!();
}

impl FromStr for PreCheck {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PULL_DOCKER_IMAGE" => Ok(PreCheck::PullDockerImage),
            "SET_HALT_HEIGHT" => Ok(PreCheck::SetHaltHeight),
            _ => Err(ParseEnumError::new("pre-upgrade check", s)),
        }
    }
}

/// Verifications run after the container switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostCheck {
    GrpcResponsive,
    ChainHeightIncreased,
    FirstBlockVoted,
}

impl PostCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostCheck::GrpcResponsive => "GRPC_RESPONSIVE",
            PostCheck::ChainHeightIncreased => "CHAIN_HEIGHT_INCREASED",
            PostCheck::FirstBlockVoted => "FIRST_BLOCK_VOTED",
        }
    }
}

impl fmt::Display for PostCheck {
    fmt_as_str!();
}

impl FromStr for PostCheck {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GRPC_RESPONSIVE" => Ok(PostCheck::GrpcResponsive),
            "CHAIN_HEIGHT_INCREASED" => Ok(PostCheck::ChainHeightIncreased),
            "FIRST_BLOCK_VOTED" => Ok(PostCheck::FirstBlockVoted),
            _ => Err(ParseEnumError::new("post-upgrade check", s)),
        }
    }
}

/// Progress of a single pre/post check at a given height.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    #[default]
    Pending,
    Running,
    Finished,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pending => "PENDING",
            CheckStatus::Running => "RUNNING",
            CheckStatus::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for CheckStatus {
    fmt_as_str!();
}

/// A scheduled image switch for the managed node at a given chain height.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Upgrade {
    pub height: i64,
    /// Container image tag. May be empty at registration time; resolved from
    /// a matching [`Version`] during a registry sync.
    #[serde(default)]
    pub tag: String,
    pub network: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub upgrade_type: UpgradeType,
    #[serde(default)]
    pub status: UpgradeStatus,
    #[serde(default)]
    pub step: UpgradeStep,
    /// Conflict-resolution rank, 1..=99, higher wins. Zero means "use the
    /// provider default".
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub source: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<i64>,
}

/// A `(height, tag)` mapping consulted to populate an upgrade's tag when the
/// upgrade was registered without one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub height: i64,
    pub tag: String,
    pub network: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub source: ProviderKind,
}

/// The upgrade plan the node itself writes to `data/upgrade-info.json` when a
/// governance upgrade halts the chain.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub height: i64,
    #[serde(default)]
    pub info: String,
}

impl Plan {
    /// A plan is only actionable with a name and a positive height.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && self.height > 0
    }
}

/// Failure to parse one of the model enums from its wire name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: `{input}`")]
pub struct ParseEnumError {
    what: &'static str,
    input: String,
}

impl ParseEnumError {
    fn new(what: &'static str, input: &str) -> Self {
        Self { what, input: input.to_owned() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_names_roundtrip() {
        for status in [
            UpgradeStatus::Unknown,
            UpgradeStatus::Scheduled,
            UpgradeStatus::Active,
            UpgradeStatus::Executing,
            UpgradeStatus::Completed,
            UpgradeStatus::Failed,
            UpgradeStatus::Cancelled,
            UpgradeStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<UpgradeStatus>().unwrap(), status);
        }
        assert_eq!("local".parse::<ProviderKind>().unwrap(), ProviderKind::Local);
        assert!("BOGUS".parse::<UpgradeStatus>().is_err());
    }

    #[test]
    fn status_classes_cover_every_variant() {
        let all = [
            UpgradeStatus::Unknown,
            UpgradeStatus::Scheduled,
            UpgradeStatus::Active,
            UpgradeStatus::Executing,
            UpgradeStatus::Completed,
            UpgradeStatus::Failed,
            UpgradeStatus::Cancelled,
            UpgradeStatus::Expired,
        ];
        for status in all {
            assert!(
                status.is_provider_input() ^ status.is_machine_managed()
                    || status == UpgradeStatus::Cancelled,
                "{status} must be exactly one of provider-input or machine-managed",
            );
        }
    }

    #[test]
    fn upgrade_serializes_with_wire_names() {
        let upgrade = Upgrade {
            height: 10,
            tag: "v2.0.0".to_owned(),
            network: "testnet-1".to_owned(),
            name: "v2".to_owned(),
            upgrade_type: UpgradeType::Governance,
            status: UpgradeStatus::Active,
            step: UpgradeStep::None,
            priority: 1,
            source: ProviderKind::Chain,
            proposal_id: Some(42),
        };
        let json = serde_json::to_value(&upgrade).unwrap();
        assert_eq!(json["type"], "GOVERNANCE");
        assert_eq!(json["status"], "ACTIVE");
        assert_eq!(json["source"], "CHAIN");
        assert_eq!(json["proposal_id"], 42);

        let back: Upgrade = serde_json::from_value(json).unwrap();
        assert_eq!(back, upgrade);
    }

    #[test]
    fn plan_validity() {
        assert!(Plan { name: "v2".into(), height: 10, info: String::new() }.is_valid());
        assert!(!Plan { name: String::new(), height: 10, info: String::new() }.is_valid());
        assert!(!Plan { name: "v2".into(), height: 0, info: String::new() }.is_valid());
    }
}
