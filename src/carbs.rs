//! Carbohydrate expansion.
//!
//! A carbs record with a positive duration describes an intake spread over
//! time ("extended carbs"). Consumers that work on discrete entries expand it
//! into fixed-width virtual ticks:
//!
//! ```text
//! 40g over 60min, 15min ticks
//!
//!   T       T+15    T+30    T+45
//!   10g     10g     10g     10g
//! ```
//!
//! Each tick takes an even share of what is left, rounded to whole grams. The
//! last tick divides by one, so it absorbs the rounding remainder and the
//! emitted amounts always add up to the original total.

use crate::payload::{Carbs, Payload};
use crate::types::{Record, HOUR_MS};

/// Longest spread a carbs record may declare.
///
/// Writes beyond it are rejected; stored rows that exceed it are expanded as
/// if they ended here.
pub const MAX_CARBS_DURATION_MS: i64 = 24 * HOUR_MS;

/// Expands `record` into virtual ticks of `tick_ms`.
///
/// Records that are not carbs, or whose duration is not positive, are
/// returned unchanged as a single element. Ticks keep the id and remote id of
/// the source record, carry zero duration, and are dropped when they round to
/// zero grams.
pub fn expand_carbs(record: &Record, tick_ms: i64) -> Vec<Record> {
    let carbs = match &record.payload {
        Payload::Carbs(c) if record.duration_ms > 0 && tick_ms > 0 => c,
        _ => return vec![record.clone()],
    };

    let ticks = (record.duration_ms.min(MAX_CARBS_DURATION_MS) / tick_ms).max(1);
    let mut remaining = carbs.amount;
    let mut out = Vec::new();

    for i in 0..ticks {
        let tick_amount = (remaining / (ticks - i) as f64).round();
        remaining -= tick_amount;
        if tick_amount == 0.0 {
            continue;
        }

        let mut tick = record.clone();
        tick.timestamp_ms = record.timestamp_ms + i * tick_ms;
        tick.duration_ms = 0;
        tick.payload = Payload::Carbs(Carbs {
            amount: tick_amount,
            notes: carbs.notes.clone(),
        });
        out.push(tick);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{Bolus, BolusType};
    use crate::types::MINUTE_MS;

    const TICK: i64 = 15 * MINUTE_MS;

    fn amounts(records: &[Record]) -> Vec<f64> {
        records
            .iter()
            .map(|r| r.payload.as_carbs().unwrap().amount)
            .collect()
    }

    #[test]
    fn test_forty_grams_over_an_hour() {
        let record = Record::new(1_000, Carbs::new(40.0)).with_duration(60 * MINUTE_MS);
        let ticks = expand_carbs(&record, TICK);

        assert_eq!(amounts(&ticks), vec![10.0, 10.0, 10.0, 10.0]);
        let times: Vec<i64> = ticks.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(times, vec![1_000, 1_000 + TICK, 1_000 + 2 * TICK, 1_000 + 3 * TICK]);
        assert!(ticks.iter().all(|r| r.duration_ms == 0));
    }

    #[test]
    fn test_zero_duration_is_unchanged() {
        let record = Record::new(1_000, Carbs::new(33.0));
        assert_eq!(expand_carbs(&record, TICK), vec![record]);
    }

    #[test]
    fn test_sum_is_conserved() {
        for amount in [1.0, 7.0, 13.0, 40.0, 101.0] {
            for minutes in [5, 15, 20, 45, 50, 90, 240] {
                let record =
                    Record::new(0, Carbs::new(amount)).with_duration(minutes * MINUTE_MS);
                let total: f64 = amounts(&expand_carbs(&record, TICK)).iter().sum();
                assert_eq!(total, amount, "amount {amount} over {minutes}min");
            }
        }
    }

    #[test]
    fn test_zero_ticks_are_dropped() {
        // 2g over 4 ticks: 0.5 rounds up to 1, then 1/3 rounds to 0, 1/2 rounds to 1.
        let record = Record::new(0, Carbs::new(2.0)).with_duration(60 * MINUTE_MS);
        let ticks = expand_carbs(&record, TICK);
        assert!(ticks.len() < 4);
        assert_eq!(amounts(&ticks).iter().sum::<f64>(), 2.0);
    }

    #[test]
    fn test_short_duration_is_one_tick() {
        let record = Record::new(0, Carbs::new(12.0)).with_duration(5 * MINUTE_MS);
        let ticks = expand_carbs(&record, TICK);
        assert_eq!(amounts(&ticks), vec![12.0]);
    }

    #[test]
    fn test_oversized_duration_is_capped() {
        let record = Record::new(0, Carbs::new(96.0)).with_duration(i64::MAX);
        let ticks = expand_carbs(&record, TICK);
        assert_eq!(ticks.len() as i64, MAX_CARBS_DURATION_MS / TICK);
        assert_eq!(amounts(&ticks).iter().sum::<f64>(), 96.0);
    }

    #[test]
    fn test_non_carbs_passthrough() {
        let record = Record::new(0, Bolus::new(1.0, BolusType::Normal)).with_duration(TICK);
        assert_eq!(expand_carbs(&record, TICK), vec![record]);
    }
}
