use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use std::collections::BTreeSet;

/// 144-second bucket width; 600 shards cover a UTC day.
const SHARD_WIDTH_SECONDS: i64 = 144;

/// Computes the Cassandra `submitted_at_date` / `shard` partition
/// predicates for a `[start, end)` window.
pub struct ShardCalculator;

impl ShardCalculator {
    pub fn shard(hour: u32, minute: u32, second: u32) -> i64 {
        (3600 * hour as i64 + 60 * minute as i64 + second as i64) / SHARD_WIDTH_SECONDS
    }

    fn shard_of(t: DateTime<Utc>) -> i64 {
        Self::shard(t.hour(), t.minute(), t.second())
    }

    /// All calendar dates touched by `[start, end]`, inclusive.
    pub fn dates_in_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<NaiveDate> {
        let start_date = start.date_naive();
        let end_date = end.date_naive();
        let mut dates = Vec::new();
        let mut d = start_date;
        while d <= end_date {
            dates.push(d);
            d += chrono::Duration::days(1);
        }
        dates
    }

    /// All shards touched by any second in `[start, end)`, plus the shard
    /// `end` lands on if `end` falls exactly on a 144-second boundary.
    pub fn shards_in_range(start: DateTime<Utc>, end: DateTime<Utc>) -> BTreeSet<i64> {
        let mut shards = BTreeSet::new();
        if start >= end {
            return shards;
        }

        // Every second needs its own bucket check only at shard
        // boundaries; walk second-by-second as the source does, since a
        // window typically spans far fewer than 144 * N seconds for any
        // appreciable N relevant to a mini-batch.
        let mut current = start;
        while current < end {
            shards.insert(Self::shard_of(current));
            current += chrono::Duration::seconds(1);
        }

        let end_shard = Self::shard_of(end);
        let total_seconds_end =
            end.hour() as i64 * 3600 + end.minute() as i64 * 60 + end.second() as i64;
        if total_seconds_end % SHARD_WIDTH_SECONDS == 0 {
            shards.insert(end_shard);
        }

        shards
    }

    /// Renders the `shard IN (...)` CQL fragment for `shards_in_range`.
    pub fn shard_in_clause(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        let shards = Self::shards_in_range(start, end);
        let list = shards
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("shard IN ({list})")
    }
}

fn ymd(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, mi, s).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_day_range_has_one_date() {
        let start = ymd(2024, 1, 1, 0, 0, 0);
        let end = ymd(2024, 1, 1, 23, 0, 0);
        assert_eq!(ShardCalculator::dates_in_range(start, end), vec![start.date_naive()]);
    }

    #[test]
    fn multi_day_range_enumerates_each_date() {
        let start = ymd(2024, 1, 1, 0, 0, 0);
        let end = ymd(2024, 1, 3, 0, 0, 0);
        let dates = ShardCalculator::dates_in_range(start, end);
        assert_eq!(dates.len(), 3);
    }

    /// Window [00:02:24, 00:04:48) covers shards {1, 2}; the end
    /// boundary lands exactly on shard 2's start and must still be
    /// included.
    #[test]
    fn shard_edge_includes_right_boundary() {
        let start = ymd(2024, 1, 1, 0, 2, 24);
        let end = ymd(2024, 1, 1, 0, 4, 48);
        let shards = ShardCalculator::shards_in_range(start, end);
        assert_eq!(shards, BTreeSet::from([1, 2]));
    }

    #[test]
    fn non_boundary_end_excludes_next_shard() {
        let start = ymd(2024, 1, 1, 0, 2, 24);
        let end = ymd(2024, 1, 1, 0, 4, 0); // not a multiple of 144s
        let shards = ShardCalculator::shards_in_range(start, end);
        assert_eq!(shards, BTreeSet::from([1]));
    }

    #[test]
    fn empty_range_has_no_shards() {
        let t = ymd(2024, 1, 1, 0, 0, 0);
        assert!(ShardCalculator::shards_in_range(t, t).is_empty());
    }

    #[test]
    fn shard_formula_matches_600_per_day() {
        // 86400 seconds / 144 = 600 shards per day.
        assert_eq!(ShardCalculator::shard(23, 59, 59), 599);
        assert_eq!(ShardCalculator::shard(0, 0, 0), 0);
    }
}
