//! Human-readable status page served at `/`.

use std::time::{Duration, SystemTime};

use helmsman_types::{Upgrade, UpgradeStatus};

use crate::api::ApiState;

pub(crate) fn render(state: &ApiState) -> String {
    let status = *state.status.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    let sync_info = state.registry.sync_info();
    let state_machine = state.registry.state_machine();

    let mut upgrades: Vec<Upgrade> = state.registry.all_upgrades_cached().into_values().collect();
    upgrades.sort_by(|a, b| b.height.cmp(&a.height));
    let overridden = state.registry.overridden_upgrades_cached();

    let mut versions: Vec<_> = state.registry.all_versions_cached().into_values().collect();
    versions.sort_by_key(|version| version.height);

    let next_upgrade = state
        .registry
        .upcoming_upgrades_cached(status.current_height, &[UpgradeStatus::Active])
        .into_iter()
        .next();

    let mut page = String::with_capacity(4096);
    page.push_str(
        "<!DOCTYPE html><html><head><title>helmsman</title>\
         <style>body{font-family:monospace;margin:2em}table{border-collapse:collapse}\
         td,th{border:1px solid #999;padding:4px 8px;text-align:left}\
         h2{margin-top:1.5em}</style></head><body><h1>helmsman</h1>",
    );

    page.push_str("<h2>node</h2><table>");
    row(&mut page, "network", state.network.as_str());
    row(&mut page, "current height", &status.current_height.to_string());
    row(&mut page, "startup height", &status.startup_height.to_string());
    row(
        &mut page,
        "block speed",
        &status
            .block_speed
            .map(|speed| format!("{:.2}s", speed.as_secs_f64()))
            .unwrap_or_else(|| "n/a".to_owned()),
    );
    row(
        &mut page,
        "last registry sync",
        &sync_info
            .last_update_time
            .and_then(|at| SystemTime::now().duration_since(at).ok())
            .map(|ago| format!("{}s ago at height {}", ago.as_secs(), sync_info.last_block_height))
            .unwrap_or_else(|| "never".to_owned()),
    );
    row(
        &mut page,
        "registry refresh interval",
        &format!("{}s", state.proposals_interval.as_secs()),
    );
    if let Some(upgrade) = &next_upgrade {
        let blocks_left = upgrade.height - status.current_height;
        let eta = status
            .block_speed
            .map(|speed| speed * blocks_left.max(0) as u32)
            .map(|eta| format_eta(eta))
            .unwrap_or_else(|| "n/a".to_owned());
        row(
            &mut page,
            "next upgrade",
            &format!("height {} ({blocks_left} blocks, ~{eta})", upgrade.height),
        );
    }
    page.push_str("</table>");

    page.push_str(
        "<h2>upgrades</h2><table><tr><th>height</th><th>name</th><th>type</th><th>tag</th>\
         <th>status</th><th>step</th><th>source</th><th>priority</th><th>overridden</th></tr>",
    );
    for upgrade in &upgrades {
        let overridden_count = overridden.get(&upgrade.height).map(Vec::len).unwrap_or(0);
        page.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
             <td>{}</td><td>{}</td><td>{}</td></tr>",
            upgrade.height,
            escape(&upgrade.name),
            upgrade.upgrade_type,
            escape(&upgrade.tag),
            state_machine.status(upgrade.height),
            state_machine.step(upgrade.height),
            upgrade.source,
            upgrade.priority,
            overridden_count,
        ));
    }
    page.push_str("</table>");

    page.push_str(
        "<h2>versions</h2><table><tr><th>height</th><th>tag</th><th>source</th>\
         <th>priority</th></tr>",
    );
    for version in &versions {
        page.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            version.height,
            escape(&version.tag),
            version.source,
            version.priority,
        ));
    }
    page.push_str("</table></body></html>");

    page
}

fn row(page: &mut String, key: &str, value: &str) {
    page.push_str(&format!("<tr><th>{key}</th><td>{}</td></tr>", escape(value)));
}

fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    if secs >= 3600 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup() {
        assert_eq!(escape("<v2&co>"), "&lt;v2&amp;co&gt;");
    }

    #[test]
    fn formats_eta() {
        assert_eq!(format_eta(Duration::from_secs(42)), "42s");
        assert_eq!(format_eta(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_eta(Duration::from_secs(7260)), "2h1m");
    }
}
