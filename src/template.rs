//! Template merging
//!
//! Turns the stored template text into a [`RelayConfig`] and fills in the
//! transport tuning knobs the template leaves unset. Values the template sets
//! explicitly always win.

use crate::config::TuningConfig;
use crate::error::{ControlError, Result};
use crate::schema::{LevelPolicy, RelayConfig, SockOpt};
use serde_json::Map;

/// Template used when the settings store holds none
pub const DEFAULT_TEMPLATE: &str = include_str!("default_template.json");

/// Policy level that unprivileged clients are assigned to
const DEFAULT_LEVEL: &str = "0";

/// Parse `raw` and merge the tuning knobs into it.
///
/// Fails with [`ControlError::TemplateParse`] when the text is not a valid
/// relay configuration; no partial config is returned.
pub fn merge_template(raw: &str, tuning: &TuningConfig) -> Result<RelayConfig> {
    let mut config: RelayConfig = serde_json::from_str(raw).map_err(ControlError::TemplateParse)?;

    let policy = config.policy.get_or_insert_with(Default::default);
    let level = policy.levels.entry(DEFAULT_LEVEL.to_string()).or_default();
    apply_level_tuning(level, tuning);

    Ok(config)
}

fn apply_level_tuning(level: &mut LevelPolicy, tuning: &TuningConfig) {
    level.handshake.get_or_insert(tuning.handshake_secs);
    level.conn_idle.get_or_insert(tuning.conn_idle_secs);
    level.uplink_only.get_or_insert(tuning.uplink_only_secs);
    level.downlink_only.get_or_insert(tuning.downlink_only_secs);
    level.buffer_size.get_or_insert(tuning.buffer_size_kb);
}

/// Socket options every inbound listener gets unless its rule sets them
pub fn socket_options(tuning: &TuningConfig) -> SockOpt {
    SockOpt {
        tcp_fast_open: Some(tuning.tcp_fast_open),
        tcp_keep_alive_interval: (tuning.tcp_keep_alive_interval_secs > 0)
            .then_some(tuning.tcp_keep_alive_interval_secs),
        tcp_no_delay: Some(tuning.tcp_no_delay),
        extra: Map::new(),
    }
}
