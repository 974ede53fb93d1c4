//! Zhongshu factor — consolidation zones over confirmed pens.
//!
//! An entry pen followed by three pens whose ranges overlap forms a zone with
//! band `[zd, zg] = [max(lows), min(highs)]` of the three followers. The band
//! is frozen at formation. Later pens that touch the band extend the zone; the
//! first pen lying entirely above `zg` or entirely below `zd` kills it, and
//! that exit pen is the earliest admissible entry for the next zone.

use serde_json::Value;

use super::{narrow, pen};
use crate::domain::{ConfirmedPen, FactorEvent, SeriesId, Time, Zhongshu, ZhongshuDead};
use crate::fingerprint::source_hash;
use crate::graph::FactorSpec;
use crate::plugin::{Capabilities, FactorPlugin, PluginError, ReplayState, TickState};
use crate::state::ZhongshuAccumulator;

pub const NAME: &str = "zhongshu";
pub const KIND_FORMED: &str = "zhongshu.formed";
pub const KIND_DEAD: &str = "zhongshu.dead";

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    None,
    Formed { zone: Zhongshu, entry: ConfirmedPen },
    Extended,
    Died(ZhongshuDead),
}

/// Apply the pen at `pens[pos]`, which arrived at `time`.
pub fn on_pen(
    zs: &mut ZhongshuAccumulator,
    pens: &[ConfirmedPen],
    pos: usize,
    time: Time,
) -> Transition {
    let pen = &pens[pos];

    if let Some(zone) = zs.alive.as_mut() {
        if pen.low() > zone.zg || pen.high() < zone.zd {
            let dead = ZhongshuDead {
                zone: zone.clone(),
                death_time: time,
                exit_pen_start_time: pen.start_time,
            };
            zs.alive = None;
            zs.next_entry_min_start = Some(pen.start_time);
            zs.dead_count += 1;
            return Transition::Died(dead);
        }
        zone.end_time = pen.end_time;
        zone.visible_time = pen.visible_time;
        return Transition::Extended;
    }

    if pos < 3 {
        return Transition::None;
    }
    let entry = &pens[pos - 3];
    if matches!(zs.next_entry_min_start, Some(min) if entry.start_time < min) {
        return Transition::None;
    }
    let followers = &pens[pos - 2..=pos];
    let zd = followers
        .iter()
        .map(ConfirmedPen::low)
        .fold(f64::NEG_INFINITY, f64::max);
    let zg = followers
        .iter()
        .map(ConfirmedPen::high)
        .fold(f64::INFINITY, f64::min);
    if zd >= zg {
        return Transition::None;
    }

    let zone = Zhongshu {
        start_time: followers[0].start_time,
        end_time: pen.end_time,
        zg,
        zd,
        entry_direction: entry.direction,
        entry_start_time: entry.start_time,
        formed_time: time,
        visible_time: time,
    };
    zs.alive = Some(zone.clone());
    zs.formed_count += 1;
    Transition::Formed {
        zone,
        entry: entry.clone(),
    }
}

#[derive(Debug, Clone)]
pub struct ZhongshuPlugin {
    spec: FactorSpec,
}

impl ZhongshuPlugin {
    pub fn new() -> Self {
        Self {
            spec: FactorSpec::new(NAME, &[pen::NAME]),
        }
    }
}

impl Default for ZhongshuPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_rank(kind: &str) -> u8 {
    if kind == KIND_FORMED {
        0
    } else {
        1
    }
}

impl FactorPlugin for ZhongshuPlugin {
    fn spec(&self) -> &FactorSpec {
        &self.spec
    }

    fn event_kinds(&self) -> &'static [&'static str] {
        &[KIND_FORMED, KIND_DEAD]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL
    }

    fn source_identity(&self) -> String {
        source_hash(include_str!("zhongshu.rs"))
    }

    fn run_tick(&self, state: &mut TickState<'_>) -> Result<(), PluginError> {
        let fresh = state.scratch.new_pens.len();
        let total = state.acc.pen.confirmed.len();
        if fresh > total {
            return Err(PluginError::Invariant {
                factor: NAME.into(),
                reason: format!("{fresh} new pens but only {total} confirmed"),
            });
        }

        for pos in total - fresh..total {
            let acc = &mut *state.acc;
            match on_pen(&mut acc.zhongshu, &acc.pen.confirmed, pos, state.time) {
                Transition::Formed { zone, entry } => {
                    let key = format!("formed:{}:{}", zone.start_time, zone.entry_start_time);
                    state.scratch.formed_zhongshu.push((zone.clone(), entry));
                    state.emit(NAME, KIND_FORMED, key, zone);
                }
                Transition::Died(dead) => {
                    let key = format!("dead:{}:{}", dead.zone.start_time, dead.zone.formed_time);
                    state.scratch.dead_zhongshu.push(dead.clone());
                    state.emit(NAME, KIND_DEAD, key, dead);
                }
                Transition::Extended | Transition::None => {}
            }
        }
        Ok(())
    }

    fn sort_rebuild_events(&self, bucket: &mut [FactorEvent]) {
        bucket.sort_by_key(|e| (e.candle_time, kind_rank(&e.kind)));
    }

    fn bootstrap_from_history(
        &self,
        _series_id: &SeriesId,
        replay: &mut ReplayState,
    ) -> Result<(), PluginError> {
        let mut zs = ZhongshuAccumulator::default();
        for event in replay.bucket(NAME) {
            if event.kind == KIND_FORMED {
                let zone: Zhongshu = narrow(NAME, event)?;
                zs.alive = Some(zone);
                zs.formed_count += 1;
            } else {
                let dead: ZhongshuDead = narrow(NAME, event)?;
                zs.alive = None;
                zs.next_entry_min_start = Some(dead.exit_pen_start_time);
                zs.dead_count += 1;
            }
        }

        // The formed payload carries the band as of formation; re-apply every
        // later pen to bring end_time forward.
        if let Some(zone) = zs.alive.as_mut() {
            let pens = &replay.acc.pen.confirmed;
            let forming = pens
                .iter()
                .position(|p| p.end_time == zone.end_time && p.visible_time == zone.formed_time)
                .ok_or_else(|| PluginError::Invariant {
                    factor: NAME.into(),
                    reason: format!("no pen formed the zone starting at {}", zone.start_time),
                })?;
            for pen in &pens[forming + 1..] {
                if pen.low() > zone.zg || pen.high() < zone.zd {
                    return Err(PluginError::Invariant {
                        factor: NAME.into(),
                        reason: format!(
                            "pen {}..{} exits the live zone without a death event",
                            pen.start_time, pen.end_time
                        ),
                    });
                }
                zone.end_time = pen.end_time;
                zone.visible_time = pen.visible_time;
            }
        }

        replay.acc.zhongshu = zs;
        Ok(())
    }

    fn build_head_snapshot(&self, state: &TickState<'_>) -> Option<Value> {
        if state.acc.pen.confirmed.is_empty() {
            return None;
        }
        let zs = &state.acc.zhongshu;
        Some(serde_json::json!({
            "alive": zs.alive,
            "formed_count": zs.formed_count,
            "dead_count": zs.dead_count,
        }))
    }
}
