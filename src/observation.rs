//! Normalizes raw vehicle reports into immutable [`Observation`]s,
//! including fuzzy run-id matching against the schedule index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};
use crate::schedule::ScheduleIndex;

/// One incoming report as it arrives from the field, prior to validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReport {
    pub vehicle_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub lat: f64,
    pub lon: f64,
    pub reported_run_id: Option<String>,
    pub assigned_block_id: Option<String>,
    pub dsc: Option<String>,
}

/// A validated report. Immutable once constructed; one per incoming report.
#[derive(Debug, Clone)]
pub struct Observation {
    pub vehicle_id: String,
    pub time: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    /// Run id assigned by the operator, when reported.
    pub op_assigned_run_id: Option<String>,
    /// Known run ids tied at the best fuzzy-match distance.
    pub best_fuzzy_run_ids: Option<BTreeSet<String>>,
    /// Edit distance of the best fuzzy match.
    pub fuzzy_match_distance: Option<u32>,
    pub assigned_block_id: Option<String>,
    pub dsc: Option<String>,
}

impl Observation {
    /// Validates a raw report and computes its fuzzy run-id matches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidObservation`] when the timestamp is missing
    /// or the coordinates fall outside a sane geographic envelope.
    pub fn from_report(report: &RawReport, index: &ScheduleIndex) -> Result<Observation> {
        let invalid = |reason: &str| Error::InvalidObservation {
            vehicle_id: report.vehicle_id.clone(),
            reason: reason.to_string(),
        };

        let time = report.timestamp.ok_or_else(|| invalid("missing timestamp"))?;

        if !report.lat.is_finite() || !report.lon.is_finite() {
            return Err(invalid("non-finite coordinates"));
        }
        if report.lat.abs() > 90.0 || report.lon.abs() > 180.0 {
            return Err(invalid("coordinates out of range"));
        }
        if report.lat.abs() < 1e-6 && report.lon.abs() < 1e-6 {
            return Err(invalid("null island coordinates"));
        }

        let (best_fuzzy_run_ids, fuzzy_match_distance) = match &report.reported_run_id {
            Some(reported) => fuzzy_match_run_ids(reported, index, time),
            None => (None, None),
        };

        Ok(Observation {
            vehicle_id: report.vehicle_id.clone(),
            time,
            lat: report.lat,
            lon: report.lon,
            op_assigned_run_id: report.reported_run_id.clone(),
            best_fuzzy_run_ids,
            fuzzy_match_distance,
            assigned_block_id: report.assigned_block_id.clone(),
            dsc: report.dsc.clone(),
        })
    }
}

impl PartialEq for Observation {
    fn eq(&self, other: &Self) -> bool {
        self.vehicle_id == other.vehicle_id
            && self.time == other.time
            && self.lat.to_bits() == other.lat.to_bits()
            && self.lon.to_bits() == other.lon.to_bits()
            && self.op_assigned_run_id == other.op_assigned_run_id
            && self.best_fuzzy_run_ids == other.best_fuzzy_run_ids
            && self.fuzzy_match_distance == other.fuzzy_match_distance
            && self.assigned_block_id == other.assigned_block_id
            && self.dsc == other.dsc
    }
}

impl Eq for Observation {}

impl Hash for Observation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.vehicle_id.hash(state);
        self.time.hash(state);
        self.lat.to_bits().hash(state);
        self.lon.to_bits().hash(state);
        self.op_assigned_run_id.hash(state);
        self.best_fuzzy_run_ids.hash(state);
        self.fuzzy_match_distance.hash(state);
        self.assigned_block_id.hash(state);
        self.dsc.hash(state);
    }
}

/// Matches a reported run id against the run ids known for the service
/// date, retaining the best edit distance and the set of ids tied at it.
fn fuzzy_match_run_ids(
    reported: &str,
    index: &ScheduleIndex,
    time: DateTime<Utc>,
) -> (Option<BTreeSet<String>>, Option<u32>) {
    let mut best_distance: Option<u32> = None;
    let mut best_ids: BTreeSet<String> = BTreeSet::new();

    for known in index.run_ids_for_date(time.date_naive()) {
        let d = levenshtein(reported, known);
        match best_distance {
            Some(best) if d > best => {}
            Some(best) if d == best => {
                best_ids.insert(known.to_string());
            }
            _ => {
                best_distance = Some(d);
                best_ids.clear();
                best_ids.insert(known.to_string());
            }
        }
    }

    match best_distance {
        Some(d) => (Some(best_ids), Some(d)),
        None => (None, None),
    }
}

/// Classic two-row Levenshtein edit distance.
fn levenshtein(a: &str, b: &str) -> u32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len() as u32;
    }
    if b.is_empty() {
        return a.len() as u32;
    }

    let mut prev: Vec<u32> = (0..=b.len() as u32).collect();
    let mut curr = vec![0u32; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i as u32 + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{BlockRecord, ScheduleBundle, TimePoint, TripSpan};
    use crate::geo::ShapePoint;
    use chrono::{NaiveDate, TimeZone};

    fn index_with_runs(run_ids: &[&str]) -> ScheduleIndex {
        let blocks = run_ids
            .iter()
            .enumerate()
            .map(|(i, run)| BlockRecord {
                block_id: format!("B{i}"),
                run_id: Some(run.to_string()),
                dsc: None,
                active_dates: vec![NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()],
                trips: vec![TripSpan {
                    trip_id: format!("T{i}"),
                    start_dist: 0.0,
                    end_dist: 1000.0,
                }],
                shape: vec![
                    ShapePoint {
                        lat: 40.70,
                        lon: -74.00,
                        shape_dist: 0.0,
                    },
                    ShapePoint {
                        lat: 40.71,
                        lon: -74.00,
                        shape_dist: 1000.0,
                    },
                ],
                timetable: vec![
                    TimePoint {
                        dist: 0.0,
                        secs: 0.0,
                    },
                    TimePoint {
                        dist: 1000.0,
                        secs: 600.0,
                    },
                ],
            })
            .collect();
        ScheduleIndex::from_bundle(ScheduleBundle { blocks })
    }

    fn report(run_id: Option<&str>) -> RawReport {
        RawReport {
            vehicle_id: "V1".to_string(),
            timestamp: Some(Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()),
            lat: 40.705,
            lon: -74.0,
            reported_run_id: run_id.map(str::to_string),
            assigned_block_id: None,
            dsc: None,
        }
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("R123", "R123"), 0);
        assert_eq!(levenshtein("R123", "R124"), 1);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[test]
    fn test_missing_timestamp_rejected() {
        let idx = index_with_runs(&["R123"]);
        let mut r = report(None);
        r.timestamp = None;
        assert!(matches!(
            Observation::from_report(&r, &idx),
            Err(Error::InvalidObservation { .. })
        ));
    }

    #[test]
    fn test_bad_coordinates_rejected() {
        let idx = index_with_runs(&["R123"]);

        let mut r = report(None);
        r.lat = 91.0;
        assert!(Observation::from_report(&r, &idx).is_err());

        let mut r = report(None);
        r.lon = f64::NAN;
        assert!(Observation::from_report(&r, &idx).is_err());

        let mut r = report(None);
        r.lat = 0.0;
        r.lon = 0.0;
        assert!(Observation::from_report(&r, &idx).is_err());
    }

    #[test]
    fn test_exact_run_match_has_distance_zero() {
        let idx = index_with_runs(&["R123", "R456"]);
        let obs = Observation::from_report(&report(Some("R123")), &idx).unwrap();
        assert_eq!(obs.fuzzy_match_distance, Some(0));
        let ids = obs.best_fuzzy_run_ids.unwrap();
        assert!(ids.contains("R123"));
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_fuzzy_match_keeps_ties() {
        let idx = index_with_runs(&["R123", "R124", "R999"]);
        let obs = Observation::from_report(&report(Some("R12X")), &idx).unwrap();
        assert_eq!(obs.fuzzy_match_distance, Some(1));
        let ids = obs.best_fuzzy_run_ids.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("R123") && ids.contains("R124"));
    }

    #[test]
    fn test_no_reported_run_id_has_no_fuzzy_data() {
        let idx = index_with_runs(&["R123"]);
        let obs = Observation::from_report(&report(None), &idx).unwrap();
        assert!(obs.best_fuzzy_run_ids.is_none());
        assert!(obs.fuzzy_match_distance.is_none());
    }

    #[test]
    fn test_no_known_runs_has_no_fuzzy_data() {
        let idx = index_with_runs(&[]);
        let obs = Observation::from_report(&report(Some("R123")), &idx).unwrap();
        assert!(obs.best_fuzzy_run_ids.is_none());
        assert!(obs.fuzzy_match_distance.is_none());
    }
}
