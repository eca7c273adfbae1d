//! Post-upgrade checks: did the node actually come back?

use std::sync::OnceLock;

use eyre::{WrapErr as _, bail};
use helmsman_chain_client::{ChainClient, RoundState};
use helmsman_config::{ChainHeightIncreased, FirstBlockVoted, GrpcResponsive};
use regex::Regex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::notifier::{CallScope, Level, Notifier};

/// Outcome of one signature probe against the consensus state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockVote {
    /// The chain was already past the target height; we could not observe
    /// our own vote in time. Inconclusive, treated as success.
    Skipped,
    /// Our prevote is visible on the target block.
    Signed,
    /// The target round is still open and our vote has not shown up yet.
    NotYetSigned,
}

fn ticker(period: std::time::Duration) -> tokio::time::Interval {
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Wait until both the API endpoint and the CometBFT endpoint serve valid
/// data again.
pub async fn grpc_responsive(
    client: &ChainClient,
    cfg: &GrpcResponsive,
    notifier: &Notifier,
    scope: CallScope,
    cancel: &CancellationToken,
) -> eyre::Result<i64> {
    let mut poll = ticker(cfg.poll_interval);
    let deadline = tokio::time::sleep(cfg.timeout);
    tokio::pin!(deadline);

    let mut api_responsive = false;
    let mut cometbft_responsive = false;
    let mut height = 0_i64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => bail!("service responsiveness check cancelled"),
            _ = &mut deadline => bail!(
                "service responsiveness check timed out after {:?} with api responsive={api_responsive} \
                 cometbft responsive={cometbft_responsive}, assuming upgrade failed",
                cfg.timeout,
            ),
            _ = poll.tick() => {
                if !api_responsive {
                    match client.latest_block_height().await {
                        Ok(observed) if observed > 0 => {
                            height = observed;
                            api_responsive = true;
                        }
                        Ok(observed) => bail!(
                            "api endpoint is responsive but observed chain height={observed} <= 0, \
                             assuming upgrade failed"
                        ),
                        Err(err) => warn!(error = %err, "api endpoint gives an error, will retry"),
                    }
                }
                if !cometbft_responsive {
                    match client.prevote_info().await {
                        Ok(prevotes) if prevotes.total_vp > 0 => cometbft_responsive = true,
                        Ok(prevotes) => bail!(
                            "cometbft endpoint is responsive but observed total voting power={} <= 0, \
                             assuming upgrade failed",
                            prevotes.total_vp,
                        ),
                        Err(err) => warn!(error = %err, "cometbft endpoint gives an error, will retry"),
                    }
                }
                if api_responsive && cometbft_responsive {
                    notifier.notify(scope, Level::Info, &format!(
                        "post-upgrade check passed, api and cometbft services are responsive, \
                         observed chain height: {height}",
                    )).await;
                    return Ok(height);
                }
            }
        }
    }
}

/// Wait until the chain height exceeds the upgrade height.
pub async fn chain_height_increased(
    client: &ChainClient,
    cfg: &ChainHeightIncreased,
    upgrade_height: i64,
    notifier: &Notifier,
    scope: CallScope,
    cancel: &CancellationToken,
) -> eyre::Result<()> {
    let mut poll = ticker(cfg.poll_interval);
    let mut notif = ticker(cfg.notif_interval);
    let deadline = tokio::time::sleep(cfg.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => bail!("height increase check cancelled"),
            _ = &mut deadline => bail!(
                "height increase check timed out after {:?}, assuming upgrade failed",
                cfg.timeout,
            ),
            _ = notif.tick() => {
                // the prevote summary tells the operator how much voting
                // power is already back online while the height is stuck
                match client.prevote_info().await {
                    Err(err) => warn!(error = %err, "error fetching prevote voting power, will retry"),
                    Ok(prevotes) if prevotes.height == upgrade_height + 1 => {
                        notifier.notify(scope, Level::Info, &format!(
                            "height did not increase yet; prevote status: online voting power={} \
                             total={} online ratio={:.2}",
                            prevotes.online_vp,
                            prevotes.total_vp,
                            prevotes.online_vp as f64 / prevotes.total_vp.max(1) as f64,
                        )).await;
                    }
                    Ok(prevotes) if prevotes.height > upgrade_height + 1 => {
                        info!(
                            observed = prevotes.height,
                            upgrade_height, "consensus is past the upgrade height, check should pass soon",
                        );
                    }
                    Ok(prevotes) => bail!(
                        "height decreased while querying prevote voting power: {}, assuming upgrade failed",
                        prevotes.height,
                    ),
                }
            }
            _ = poll.tick() => {
                // the height comes from the plain block endpoint; the
                // consensus-state route is only trusted for voting power
                match client.latest_block_height().await {
                    Err(err) => warn!(error = %err, "api endpoint gives an error, will retry"),
                    Ok(height) if height > upgrade_height => {
                        notifier.notify(scope, Level::Info, &format!(
                            "post-upgrade check passed, chain height increased to {height}",
                        )).await;
                        return Ok(());
                    }
                    Ok(height) if height == upgrade_height => {
                        info!("height did not increase yet, will retry");
                    }
                    Ok(height) => bail!(
                        "height decreased after the api endpoint became responsive: {height}, \
                         assuming upgrade failed"
                    ),
                }
            }
        }
    }
}

/// Wait until this validator's prevote shows up on the first block after the
/// upgrade.
pub async fn first_block_voted(
    client: &ChainClient,
    cfg: &FirstBlockVoted,
    upgrade_height: i64,
    notifier: &Notifier,
    scope: CallScope,
    cancel: &CancellationToken,
) -> eyre::Result<()> {
    let status = client.status().await.wrap_err("could not get node status")?;

    if status.voting_power == 0 {
        notifier
            .notify(scope, Level::Info, "skipping the signature check, validator has no voting power")
            .await;
        return Ok(());
    }
    notifier
        .notify(
            scope,
            Level::Info,
            &format!(
                "waiting to sign the first block after upgrade height {upgrade_height}, \
                 validator address {}",
                status.validator_address,
            ),
        )
        .await;

    let mut poll = ticker(cfg.poll_interval);
    let mut notif = ticker(cfg.notif_interval);
    let deadline = tokio::time::sleep(cfg.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => bail!("first block signature check cancelled"),
            _ = &mut deadline => bail!(
                "first block signature check timed out after {:?}, assuming upgrade failed",
                cfg.timeout,
            ),
            _ = notif.tick() => {
                notifier.notify(scope, Level::Info, "upgrade block not signed yet").await;
            }
            _ = poll.tick() => {
                let round_state = match client.round_state().await {
                    Ok(round_state) => round_state,
                    Err(err) => {
                        warn!(error = %err, "error fetching consensus state, will retry");
                        continue;
                    }
                };
                match check_block_signed_by(&status.validator_address, upgrade_height, &round_state) {
                    Err(err) => warn!(error = %err, "error checking our vote, will retry"),
                    Ok(BlockVote::Skipped) => {
                        notifier.notify(scope, Level::Info,
                            "signature check inconclusive, height increased before our own vote was observable",
                        ).await;
                        return Ok(());
                    }
                    Ok(BlockVote::Signed) => {
                        notifier.notify(scope, Level::Info,
                            "signature check passed, observed our own signature on the upgrade block",
                        ).await;
                        return Ok(());
                    }
                    Ok(BlockVote::NotYetSigned) => {}
                }
            }
        }
    }
}

/// Decide whether `address` has already prevoted on the block at `height`.
pub fn check_block_signed_by(
    address: &str,
    height: i64,
    round_state: &RoundState,
) -> eyre::Result<BlockVote> {
    let (current_height, _, _) = round_state
        .height_round_step()
        .map_err(|err| eyre::eyre!("error parsing consensus state: {err}"))?;

    if current_height > height {
        return Ok(BlockVote::Skipped);
    }

    if has_address_signed(address, round_state)? {
        Ok(BlockVote::Signed)
    } else {
        Ok(BlockVote::NotYetSigned)
    }
}

/// Prevote strings embed a truncated validator address:
/// `Vote{idx:ADDRPREFIX height/round/... }`.
fn prevote_signature_prefix(prevote: &str) -> eyre::Result<&str> {
    static PREVOTE_RE: OnceLock<Regex> = OnceLock::new();
    let regex = PREVOTE_RE
        .get_or_init(|| Regex::new(r"Vote\{\d+:([A-Fa-f0-9]+)\s").expect("static regex compiles"));
    regex
        .captures(prevote)
        .and_then(|captures| captures.get(1))
        .map(|prefix| prefix.as_str())
        .ok_or_else(|| eyre::eyre!("signature not found in prevote string `{prevote}`"))
}

fn has_address_signed(address: &str, round_state: &RoundState) -> eyre::Result<bool> {
    let address = address.to_ascii_uppercase();
    for vote_set in &round_state.height_vote_set {
        for prevote in &vote_set.prevotes {
            if prevote == "nil-Vote" {
                continue;
            }
            let prefix = prevote_signature_prefix(prevote)?.to_ascii_uppercase();
            if address.starts_with(&prefix) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "8FA3A9966F20D6E4F04A12DD8194F2A1B1BEE1B1";

    fn round_state(height_round_step: &str, prevotes: Vec<&str>) -> RoundState {
        serde_json::from_value(serde_json::json!({
            "height/round/step": height_round_step,
            "height_vote_set": [{
                "round": 0,
                "prevotes": prevotes,
                "prevotes_bit_array": "BA{2:xx} 20/20 = 1.00"
            }]
        }))
        .unwrap()
    }

    #[test]
    fn parses_prevote_signature_prefix() {
        let prevote = "Vote{0:8FA3A9966F20 12/00/SIGNED_MSG_TYPE_PREVOTE(Prevote) 8B01023386C7 000000000000 @ 2024-01-01T00:00:00.0Z}";
        assert_eq!(prevote_signature_prefix(prevote).unwrap(), "8FA3A9966F20");
        assert!(prevote_signature_prefix("nil-Vote").is_err());
    }

    #[test]
    fn detects_own_signature() {
        let state = round_state("12/0/3", vec!["nil-Vote", "Vote{0:8FA3A9966F20 12/0/Prevote ..."]);
        assert_eq!(check_block_signed_by(ADDRESS, 12, &state).unwrap(), BlockVote::Signed);
    }

    #[test]
    fn missing_signature_is_not_signed_yet() {
        let state = round_state("12/0/3", vec!["nil-Vote", "Vote{0:AABBCCDDEEFF 12/0/Prevote ..."]);
        assert_eq!(check_block_signed_by(ADDRESS, 12, &state).unwrap(), BlockVote::NotYetSigned);
    }

    #[test]
    fn past_height_is_skipped() {
        let state = round_state("13/0/1", vec!["nil-Vote"]);
        assert_eq!(check_block_signed_by(ADDRESS, 12, &state).unwrap(), BlockVote::Skipped);
    }

    #[test]
    fn garbled_prevote_is_an_error() {
        let state = round_state("12/0/3", vec!["Vote{borked"]);
        assert!(check_block_signed_by(ADDRESS, 12, &state).is_err());
    }
}
