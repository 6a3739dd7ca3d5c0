//! Read-only schedule index: blocks, trips, shapes, timetables, and run
//! identifiers, loaded once from a JSON snapshot and shared immutably
//! across all vehicle workers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::geo::{self, PolylineSnap, ShapePoint};

/// The distance span a single trip occupies within its block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripSpan {
    pub trip_id: String,
    pub start_dist: f64,
    pub end_dist: f64,
}

/// One timetable node: scheduled seconds since service-date midnight at a
/// given distance along the block.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimePoint {
    pub dist: f64,
    pub secs: f64,
}

/// A block as it appears in the snapshot: one vehicle's scheduled day of
/// work, with its shape geometry and timetable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub block_id: String,
    pub run_id: Option<String>,
    pub dsc: Option<String>,
    pub active_dates: Vec<NaiveDate>,
    pub trips: Vec<TripSpan>,
    pub shape: Vec<ShapePoint>,
    pub timetable: Vec<TimePoint>,
}

/// On-disk schedule snapshot, rebuilt out-of-band by the bundle pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleBundle {
    pub blocks: Vec<BlockRecord>,
}

/// Static per-block data shared by every instance of that block.
#[derive(Debug)]
pub struct BlockEntry {
    pub block_id: String,
    pub run_id: Option<String>,
    pub dsc: Option<String>,
    pub trips: Vec<TripSpan>,
    pub shape: Vec<ShapePoint>,
    pub timetable: Vec<TimePoint>,
}

impl BlockEntry {
    pub fn total_distance(&self) -> f64 {
        self.shape.last().map(|p| p.shape_dist).unwrap_or(0.0)
    }

    /// Scheduled time (seconds since service-date midnight) at a distance
    /// along the block, by piecewise-linear interpolation over the
    /// timetable. Clamped to the first/last timetable node.
    pub fn scheduled_time_at(&self, dist: f64) -> f64 {
        let (Some(first), Some(last)) = (self.timetable.first(), self.timetable.last()) else {
            return 0.0;
        };

        if dist <= first.dist {
            return first.secs;
        }
        if dist >= last.dist {
            return last.secs;
        }

        for seg in self.timetable.windows(2) {
            let (a, b) = (seg[0], seg[1]);
            if dist >= a.dist && dist <= b.dist {
                let span = b.dist - a.dist;
                let t = if span == 0.0 { 0.0 } else { (dist - a.dist) / span };
                return a.secs + t * (b.secs - a.secs);
            }
        }

        last.secs
    }

    /// Like [`scheduled_time_at`](Self::scheduled_time_at), but where two
    /// timetable nodes share a distance (a layover boundary: arrival then
    /// departure), this returns the departure side.
    pub fn scheduled_departure_at(&self, dist: f64) -> f64 {
        let (Some(first), Some(last)) = (self.timetable.first(), self.timetable.last()) else {
            return 0.0;
        };

        if dist <= first.dist {
            return first.secs;
        }
        if dist >= last.dist {
            return last.secs;
        }

        for seg in self.timetable.windows(2).rev() {
            let (a, b) = (seg[0], seg[1]);
            if dist >= a.dist && dist <= b.dist {
                let span = b.dist - a.dist;
                let t = if span == 0.0 { 1.0 } else { (dist - a.dist) / span };
                return a.secs + t * (b.secs - a.secs);
            }
        }

        last.secs
    }

    /// The trip whose distance span contains `dist`. Distances before the
    /// first trip map to the first trip, past the last to the last.
    pub fn trip_at(&self, dist: f64) -> Option<&TripSpan> {
        if self.trips.is_empty() {
            return None;
        }
        self.trips
            .iter()
            .find(|t| dist >= t.start_dist && dist <= t.end_dist)
            .or_else(|| {
                if dist < self.trips[0].start_dist {
                    self.trips.first()
                } else {
                    self.trips.last()
                }
            })
    }

    /// Distance to the nearest trip boundary (any trip start or end).
    pub fn distance_to_trip_boundary(&self, dist: f64) -> f64 {
        self.trips
            .iter()
            .flat_map(|t| [t.start_dist, t.end_dist])
            .map(|b| (b - dist).abs())
            .fold(f64::INFINITY, f64::min)
    }

    pub fn snap(&self, lat: f64, lon: f64) -> Option<PolylineSnap> {
        geo::snap_to_polyline(lat, lon, &self.shape)
    }

    pub fn point_at(&self, dist: f64) -> Option<(f64, f64)> {
        geo::point_at_distance(&self.shape, dist)
    }
}

/// A block on a concrete service date.
#[derive(Debug, Clone)]
pub struct BlockInstance {
    pub service_date: NaiveDate,
    pub block: Arc<BlockEntry>,
}

impl BlockInstance {
    /// Epoch milliseconds of the service date's midnight (UTC).
    pub fn service_date_epoch_ms(&self) -> i64 {
        self.service_date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or_default()
    }
}

/// Immutable-after-load lookup over the schedule graph.
#[derive(Debug)]
pub struct ScheduleIndex {
    by_date: HashMap<NaiveDate, Vec<Arc<BlockInstance>>>,
    run_ids_by_date: HashMap<NaiveDate, BTreeSet<String>>,
    block_count: usize,
}

impl ScheduleIndex {
    pub fn from_bundle(bundle: ScheduleBundle) -> Self {
        let mut by_date: HashMap<NaiveDate, Vec<Arc<BlockInstance>>> = HashMap::new();
        let mut run_ids_by_date: HashMap<NaiveDate, BTreeSet<String>> = HashMap::new();
        let block_count = bundle.blocks.len();

        for record in bundle.blocks {
            let entry = Arc::new(BlockEntry {
                block_id: record.block_id,
                run_id: record.run_id,
                dsc: record.dsc,
                trips: record.trips,
                shape: record.shape,
                timetable: record.timetable,
            });

            for date in &record.active_dates {
                by_date
                    .entry(*date)
                    .or_default()
                    .push(Arc::new(BlockInstance {
                        service_date: *date,
                        block: Arc::clone(&entry),
                    }));
                if let Some(run_id) = &entry.run_id {
                    run_ids_by_date
                        .entry(*date)
                        .or_default()
                        .insert(run_id.clone());
                }
            }
        }

        ScheduleIndex {
            by_date,
            run_ids_by_date,
            block_count,
        }
    }

    /// Loads the JSON snapshot. Failure here is fatal for the service.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| Error::ScheduleIndexUnavailable(format!("{}: {e}", path.display())))?;
        let bundle: ScheduleBundle = serde_json::from_slice(&bytes)
            .map_err(|e| Error::ScheduleIndexUnavailable(format!("{}: {e}", path.display())))?;
        Ok(Self::from_bundle(bundle))
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Block instances active on the observation's service date.
    pub fn active_instances_at(&self, time: DateTime<Utc>) -> &[Arc<BlockInstance>] {
        self.by_date
            .get(&time.date_naive())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Known run ids for a service date, for fuzzy matching.
    pub fn run_ids_for_date(&self, date: NaiveDate) -> impl Iterator<Item = &str> {
        self.run_ids_by_date
            .get(&date)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Spatial query: every active block whose shape passes within
    /// `radius_m` of the point, with the snapped location on each.
    pub fn blocks_near(
        &self,
        lat: f64,
        lon: f64,
        time: DateTime<Utc>,
        radius_m: f64,
    ) -> Vec<(Arc<BlockInstance>, PolylineSnap)> {
        let mut hits = Vec::new();
        for instance in self.active_instances_at(time) {
            if let Some(snap) = instance.block.snap(lat, lon) {
                if snap.offset_m <= radius_m {
                    hits.push((Arc::clone(instance), snap));
                }
            }
        }
        hits
    }
}
