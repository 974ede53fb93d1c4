//! Anchor factor — the single tracked reference leg.
//!
//! Two things can move the anchor during a tick, evaluated in this order:
//! 1. the entry pen of a zone formed this tick (`zhongshu_entry`)
//! 2. the strongest confirmed pen or extending candidate of this tick, if it
//!    beats the anchor strength recorded at tick start (`strong_pen`)
//!
//! A candidate with the same `start_time` as the current anchor is the same
//! leg seen again; it is suppressed and leaves the anchor untouched.

use serde_json::Value;

use super::{narrow, pen, zhongshu};
use crate::domain::{AnchorRef, AnchorSwitch, FactorEvent, SeriesId, SwitchReason, Time};
use crate::fingerprint::source_hash;
use crate::graph::FactorSpec;
use crate::plugin::{Capabilities, FactorPlugin, PluginError, ReplayState, TickScratch, TickState};
use crate::state::AnchorAccumulator;

pub const NAME: &str = "anchor";
pub const KIND_SWITCH: &str = "anchor.switch";

/// Switch to `candidate` unless it is the leg already anchored.
pub fn consider(
    anchor: &mut AnchorAccumulator,
    candidate: AnchorRef,
    reason: SwitchReason,
    time: Time,
) -> Option<AnchorSwitch> {
    if matches!(&anchor.current, Some(current) if current.same_identity(&candidate)) {
        return None;
    }
    let strength = candidate.strength();
    let switch = AnchorSwitch {
        switch_time: time,
        visible_time: time,
        reason,
        previous: anchor.current.take(),
        current: candidate.clone(),
        strength,
    };
    anchor.current = Some(candidate);
    anchor.strength = strength;
    anchor.switch_count += 1;
    Some(switch)
}

/// Strongest leg seen this tick. Confirmed pens win ties over the candidate.
pub fn strongest_leg(scratch: &TickScratch) -> Option<AnchorRef> {
    scratch
        .new_pens
        .iter()
        .map(AnchorRef::from)
        .chain(scratch.pen_candidate.iter().map(AnchorRef::from))
        .fold(None, |best: Option<AnchorRef>, leg| match best {
            Some(b) if b.strength() >= leg.strength() => Some(b),
            _ => Some(leg),
        })
}

#[derive(Debug, Clone)]
pub struct AnchorPlugin {
    spec: FactorSpec,
}

impl AnchorPlugin {
    pub fn new() -> Self {
        Self {
            spec: FactorSpec::new(NAME, &[pen::NAME, zhongshu::NAME]),
        }
    }
}

impl Default for AnchorPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn reason_rank(event: &FactorEvent) -> u8 {
    match event.payload_as::<AnchorSwitch>().map(|s| s.reason) {
        Ok(SwitchReason::ZhongshuEntry) => 0,
        Ok(SwitchReason::StrongPen) => 1,
        Err(_) => 2,
    }
}

impl FactorPlugin for AnchorPlugin {
    fn spec(&self) -> &FactorSpec {
        &self.spec
    }

    fn event_kinds(&self) -> &'static [&'static str] {
        &[KIND_SWITCH]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL
    }

    fn source_identity(&self) -> String {
        source_hash(include_str!("anchor.rs"))
    }

    fn run_tick(&self, state: &mut TickState<'_>) -> Result<(), PluginError> {
        let mut switches = Vec::new();

        for (_, entry) in &state.scratch.formed_zhongshu {
            let candidate = AnchorRef::from(entry);
            switches.extend(consider(
                &mut state.acc.anchor,
                candidate,
                SwitchReason::ZhongshuEntry,
                state.time,
            ));
        }

        if let Some(leg) = strongest_leg(&state.scratch) {
            if leg.strength() > state.baseline_anchor_strength {
                switches.extend(consider(
                    &mut state.acc.anchor,
                    leg,
                    SwitchReason::StrongPen,
                    state.time,
                ));
            }
        }

        for switch in switches {
            let key = format!(
                "switch:{}:{}:{}",
                switch.switch_time,
                switch.current.kind.as_str(),
                switch.current.start_time
            );
            state.emit(NAME, KIND_SWITCH, key, switch);
        }
        Ok(())
    }

    fn sort_rebuild_events(&self, bucket: &mut [FactorEvent]) {
        bucket.sort_by_key(|e| {
            let switch_time = e
                .payload_as::<AnchorSwitch>()
                .map(|s| s.switch_time)
                .unwrap_or(i64::MAX);
            (e.candle_time, switch_time, reason_rank(e))
        });
    }

    fn bootstrap_from_history(
        &self,
        _series_id: &SeriesId,
        replay: &mut ReplayState,
    ) -> Result<(), PluginError> {
        let bucket = replay.bucket(NAME);
        let mut anchor = AnchorAccumulator {
            switch_count: bucket.len() as u64,
            ..AnchorAccumulator::default()
        };
        if let Some(last) = bucket.last() {
            let switch: AnchorSwitch = narrow(NAME, last)?;
            anchor.current = Some(switch.current);
            anchor.strength = switch.strength;
        }
        replay.acc.anchor = anchor;
        Ok(())
    }

    fn build_head_snapshot(&self, state: &TickState<'_>) -> Option<Value> {
        let anchor = &state.acc.anchor;
        let current = anchor.current.as_ref()?;

        // The anchored leg may have kept extending since the switch.
        let live = state
            .scratch
            .pen_candidate
            .as_ref()
            .filter(|c| c.start_time == current.start_time)
            .map(AnchorRef::from)
            .or_else(|| {
                state
                    .acc
                    .pen
                    .confirmed
                    .iter()
                    .rev()
                    .find(|p| p.start_time == current.start_time)
                    .map(AnchorRef::from)
            })
            .unwrap_or_else(|| current.clone());

        Some(serde_json::json!({
            "current": current,
            "strength": anchor.strength,
            "switch_count": anchor.switch_count,
            "live_end_time": live.end_time,
            "live_strength": live.strength(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::domain::{AnchorKind, ConfirmedPen, PenCandidate, Zhongshu};
    use crate::state::FactorAccumulators;

    fn candidate(start: i64, end: i64, start_price: f64, end_price: f64) -> PenCandidate {
        PenCandidate {
            start_time: start,
            end_time: end,
            start_price,
            end_price,
            direction: if end_price > start_price { 1 } else { -1 },
        }
    }

    fn confirmed(start: i64, end: i64, start_price: f64, end_price: f64) -> ConfirmedPen {
        ConfirmedPen {
            start_time: start,
            end_time: end,
            start_price,
            end_price,
            direction: if end_price > start_price { 1 } else { -1 },
            visible_time: end + 60,
            start_index: 0,
            end_index: 1,
        }
    }

    #[test]
    fn same_start_time_is_suppressed() {
        let mut anchor = AnchorAccumulator::default();
        let first = consider(
            &mut anchor,
            AnchorRef::from(&candidate(60, 120, 10.0, 20.0)),
            SwitchReason::StrongPen,
            120,
        );
        assert!(first.is_some());

        // The candidate later confirms with the same start and a larger move.
        let second = consider(
            &mut anchor,
            AnchorRef::from(&confirmed(60, 180, 10.0, 25.0)),
            SwitchReason::StrongPen,
            240,
        );
        assert!(second.is_none());
        assert_eq!(anchor.switch_count, 1);
        assert_eq!(anchor.strength, 10.0);
        assert_eq!(anchor.current.as_ref().unwrap().kind, AnchorKind::Candidate);
    }

    #[test]
    fn switch_records_previous() {
        let mut anchor = AnchorAccumulator::default();
        consider(
            &mut anchor,
            AnchorRef::from(&confirmed(60, 120, 10.0, 20.0)),
            SwitchReason::StrongPen,
            180,
        );
        let switch = consider(
            &mut anchor,
            AnchorRef::from(&confirmed(120, 180, 20.0, 5.0)),
            SwitchReason::ZhongshuEntry,
            240,
        )
        .unwrap();
        assert_eq!(switch.previous.unwrap().start_time, 60);
        assert_eq!(switch.current.start_time, 120);
        assert_eq!(switch.strength, 15.0);
        assert_eq!(anchor.switch_count, 2);
    }

    #[test]
    fn strongest_leg_prefers_confirmed_on_tie() {
        let scratch = TickScratch {
            new_pens: vec![confirmed(60, 120, 10.0, 20.0)],
            pen_candidate: Some(candidate(120, 180, 20.0, 10.0)),
            ..TickScratch::default()
        };
        let leg = strongest_leg(&scratch).unwrap();
        assert_eq!(leg.kind, AnchorKind::Confirmed);

        let scratch = TickScratch {
            new_pens: vec![confirmed(60, 120, 10.0, 20.0)],
            pen_candidate: Some(candidate(120, 180, 20.0, 5.0)),
            ..TickScratch::default()
        };
        assert_eq!(strongest_leg(&scratch).unwrap().kind, AnchorKind::Candidate);
        assert!(strongest_leg(&TickScratch::default()).is_none());
    }

    fn zone_with_entry(entry: &ConfirmedPen) -> (Zhongshu, ConfirmedPen) {
        let zone = Zhongshu {
            start_time: entry.start_time,
            end_time: entry.end_time + 120,
            zg: 12.0,
            zd: 11.0,
            entry_direction: entry.direction,
            entry_start_time: entry.start_time,
            formed_time: 600,
            visible_time: 600,
        };
        (zone, entry.clone())
    }

    /// One tick with a zone entry and a strong pen, starting from an anchor
    /// of strength 10.
    fn run_mixed_tick(
        entry: ConfirmedPen,
        strong: ConfirmedPen,
    ) -> (Vec<AnchorSwitch>, FactorAccumulators) {
        let series: SeriesId = "test:spot:X/Y:1m".parse().unwrap();
        let time_to_idx = HashMap::new();
        let mut acc = FactorAccumulators::default();
        consider(
            &mut acc.anchor,
            AnchorRef::from(&confirmed(0, 60, 0.0, 10.0)),
            SwitchReason::StrongPen,
            120,
        );

        let mut state = TickState::new(&series, &[], &time_to_idx, 600, 0, &mut acc);
        assert_eq!(state.baseline_anchor_strength, 10.0);
        state.scratch.formed_zhongshu.push(zone_with_entry(&entry));
        state.scratch.new_pens.push(strong);
        AnchorPlugin::new().run_tick(&mut state).unwrap();

        let switches = state
            .events
            .iter()
            .map(|e| e.payload_as::<AnchorSwitch>().unwrap())
            .collect();
        (switches, acc)
    }

    #[test]
    fn strong_pen_is_judged_against_tick_start_after_a_weaker_zone_entry() {
        // The zone entry drops the anchor to 3. An 8-point pen beats that but
        // not the 10 the tick started with.
        let (switches, acc) = run_mixed_tick(
            confirmed(180, 240, 10.0, 13.0),
            confirmed(420, 480, 20.0, 12.0),
        );
        assert_eq!(switches.len(), 1);
        assert_eq!(switches[0].reason, SwitchReason::ZhongshuEntry);
        assert_eq!(switches[0].previous.as_ref().unwrap().start_time, 0);
        assert_eq!(acc.anchor.current.as_ref().unwrap().start_time, 180);
        assert_eq!(acc.anchor.strength, 3.0);
    }

    #[test]
    fn strong_pen_is_judged_against_tick_start_after_a_stronger_zone_entry() {
        // The zone entry raises the anchor to 20. A 15-point pen is weaker
        // than that but beats the 10 the tick started with, so it still wins.
        let (switches, acc) = run_mixed_tick(
            confirmed(180, 240, 10.0, 30.0),
            confirmed(420, 480, 30.0, 15.0),
        );
        let reasons: Vec<SwitchReason> = switches.iter().map(|s| s.reason).collect();
        assert_eq!(reasons, vec![SwitchReason::ZhongshuEntry, SwitchReason::StrongPen]);
        assert_eq!(switches[1].previous.as_ref().unwrap().start_time, 180);
        assert_eq!(acc.anchor.current.as_ref().unwrap().start_time, 420);
        assert_eq!(acc.anchor.strength, 15.0);
        assert_eq!(acc.anchor.switch_count, 3);
    }
}
