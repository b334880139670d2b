use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

/// One aggregated storage sample: a table's size on a given day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub entity_id: String,
    pub observation_date: NaiveDate,
    pub size_value: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum ObservationError {
    #[error("observation has an empty table name")]
    EmptyEntity,
    #[error("size for {entity} on {date} is not a finite number")]
    NonFinite { entity: String, date: NaiveDate },
    #[error("size for {entity} on {date} is negative ({value})")]
    Negative {
        entity: String,
        date: NaiveDate,
        value: f64,
    },
}

impl Observation {
    /// Validating constructor; malformed samples are rejected rather than coerced.
    pub fn new(
        entity_id: impl Into<String>,
        observation_date: NaiveDate,
        size_value: f64,
    ) -> Result<Self, ObservationError> {
        let entity_id = entity_id.into();
        if entity_id.is_empty() {
            return Err(ObservationError::EmptyEntity);
        }
        if !size_value.is_finite() {
            return Err(ObservationError::NonFinite {
                entity: entity_id,
                date: observation_date,
            });
        }
        if size_value < 0.0 {
            return Err(ObservationError::Negative {
                entity: entity_id,
                date: observation_date,
                value: size_value,
            });
        }
        Ok(Self {
            entity_id,
            observation_date,
            size_value,
        })
    }
}

/// A table's position in the latest-date ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedTable {
    pub rank: usize,
    pub table: String,
    pub size_value: f64,
}

/// Result of ranking a series on its most recent date.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopN {
    pub latest_date: Option<NaiveDate>,
    pub ranked: Vec<RankedTable>,
    pub series: Vec<Observation>,
}

/// First and last sample of a table inside the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableGrowth {
    pub table: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub start_value: f64,
    pub end_value: f64,
    pub delta: f64,
}

pub fn latest_date(series: &[Observation]) -> Option<NaiveDate> {
    series.iter().map(|obs| obs.observation_date).max()
}

/// Rank tables by size on the latest date and keep the full history of the top `n`.
///
/// Ranking is a stable descending sort, so equal sizes keep input order and the
/// earlier table wins a tied cutoff slot.
pub fn rank_latest(series: &[Observation], n: usize) -> TopN {
    let Some(latest) = latest_date(series) else {
        return TopN::default();
    };

    let mut latest_slice: Vec<&Observation> = series
        .iter()
        .filter(|obs| obs.observation_date == latest)
        .collect();
    latest_slice.sort_by(|a, b| {
        b.size_value
            .partial_cmp(&a.size_value)
            .unwrap_or(Ordering::Equal)
    });

    let mut selected: HashSet<&str> = HashSet::with_capacity(n.min(latest_slice.len()));
    let mut ranked = Vec::with_capacity(n.min(latest_slice.len()));
    for obs in latest_slice {
        if ranked.len() == n {
            break;
        }
        if selected.insert(obs.entity_id.as_str()) {
            ranked.push(RankedTable {
                rank: ranked.len() + 1,
                table: obs.entity_id.clone(),
                size_value: obs.size_value,
            });
        }
    }

    let series = series
        .iter()
        .filter(|obs| selected.contains(obs.entity_id.as_str()))
        .cloned()
        .collect();

    TopN {
        latest_date: Some(latest),
        ranked,
        series,
    }
}

/// Full time series of the `n` largest tables on the most recent date.
pub fn select_top_n(series: &[Observation], n: usize) -> Vec<Observation> {
    rank_latest(series, n).series
}

/// Per-table growth across the window, in first-seen order.
pub fn growth_deltas(series: &[Observation]) -> Vec<TableGrowth> {
    let mut order: Vec<&str> = Vec::new();
    let mut bounds: HashMap<&str, (&Observation, &Observation)> = HashMap::new();

    for obs in series {
        match bounds.get_mut(obs.entity_id.as_str()) {
            Some((first, last)) => {
                if obs.observation_date < first.observation_date {
                    *first = obs;
                }
                if obs.observation_date >= last.observation_date {
                    *last = obs;
                }
            }
            None => {
                order.push(obs.entity_id.as_str());
                bounds.insert(obs.entity_id.as_str(), (obs, obs));
            }
        }
    }

    order
        .into_iter()
        .filter_map(|table| bounds.get(table))
        .map(|(first, last)| TableGrowth {
            table: first.entity_id.clone(),
            start_date: first.observation_date,
            end_date: last.observation_date,
            start_value: first.size_value,
            end_value: last.size_value,
            delta: last.size_value - first.size_value,
        })
        .collect()
}
