use std::collections::HashSet;

use chrono::NaiveDate;
use stormon::growth::{latest_date, rank_latest};
use stormon::{Observation, select_top_n};

fn obs(entity: &str, date: &str, size: f64) -> Observation {
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("date");
    Observation::new(entity, date, size).expect("observation")
}

fn entities(series: &[Observation]) -> HashSet<String> {
    series.iter().map(|o| o.entity_id.clone()).collect()
}

fn sample_series() -> Vec<Observation> {
    vec![
        obs("A", "2024-01-01", 10.0),
        obs("A", "2024-01-02", 20.0),
        obs("B", "2024-01-01", 5.0),
        obs("B", "2024-01-02", 30.0),
        obs("C", "2024-01-02", 25.0),
    ]
}

#[test]
fn selects_largest_tables_on_latest_date() {
    let series = sample_series();
    let result = select_top_n(&series, 2);
    assert_eq!(
        result,
        vec![
            obs("B", "2024-01-01", 5.0),
            obs("B", "2024-01-02", 30.0),
            obs("C", "2024-01-02", 25.0),
        ]
    );

    let top = rank_latest(&series, 2);
    assert_eq!(top.latest_date, NaiveDate::from_ymd_opt(2024, 1, 2));
    let ranked: Vec<_> = top.ranked.iter().map(|r| r.table.as_str()).collect();
    assert_eq!(ranked, vec!["B", "C"]);
}

#[test]
fn empty_series_yields_empty_result() {
    assert!(select_top_n(&[], 5).is_empty());
    assert!(latest_date(&[]).is_none());
    let top = rank_latest(&[], 5);
    assert!(top.latest_date.is_none());
    assert!(top.ranked.is_empty());
}

#[test]
fn limit_above_entity_count_returns_everything() {
    let series = sample_series();
    let result = select_top_n(&series, 10);
    assert_eq!(result, series);
    assert_eq!(entities(&result).len(), 3);
}

#[test]
fn ties_at_cutoff_go_to_earlier_input() {
    let series = vec![
        obs("X", "2024-02-01", 7.0),
        obs("Y", "2024-02-01", 9.0),
        obs("Z", "2024-02-01", 7.0),
        obs("W", "2024-02-01", 7.0),
    ];
    let result = select_top_n(&series, 2);
    assert_eq!(
        entities(&result),
        ["Y", "X"]
            .iter()
            .map(|s| s.to_string())
            .collect::<HashSet<String>>()
    );

    // Repeated calls agree even under ties.
    for _ in 0..5 {
        assert_eq!(select_top_n(&series, 2), result);
    }
}

#[test]
fn result_is_subset_with_full_histories() {
    let mut series = Vec::new();
    for (idx, table) in ["T1", "T2", "T3", "T4", "T5", "T6"].iter().enumerate() {
        for day in 1..=9 {
            let size = (idx as f64 + 1.0) * day as f64 * if idx % 2 == 0 { 1.0 } else { 0.5 };
            series.push(obs(table, &format!("2024-03-0{day}"), size));
        }
    }

    for n in 1..=8 {
        let result = select_top_n(&series, n);
        let selected = entities(&result);
        assert!(selected.is_subset(&entities(&series)));
        assert_eq!(selected.len(), n.min(6));

        for table in &selected {
            let original: Vec<_> = series.iter().filter(|o| &o.entity_id == table).collect();
            let kept: Vec<_> = result.iter().filter(|o| &o.entity_id == table).collect();
            assert_eq!(original, kept, "history for {table} must be preserved");
        }

        if n <= 6 {
            assert_eq!(select_top_n(&result, n), result, "selection is idempotent");
        }
    }
}

#[test]
fn only_entities_present_on_latest_date_count() {
    let series = vec![
        obs("OLD", "2024-01-01", 900.0),
        obs("A", "2024-01-01", 1.0),
        obs("A", "2024-01-03", 2.0),
        obs("B", "2024-01-03", 3.0),
    ];
    let result = select_top_n(&series, 5);
    let selected = entities(&result);
    assert_eq!(selected.len(), 2);
    assert!(!selected.contains("OLD"));
    assert_eq!(result[0], obs("A", "2024-01-01", 1.0));
}
