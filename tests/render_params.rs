use stormon::config::{DashboardOptions, Sections};
use stormon::http::{RenderParams, apply_render_params};

#[test]
fn overrides_replace_configured_view() {
    let params = RenderParams {
        days: Some(14),
        top: Some(3),
        forecast: Some(false),
        ..RenderParams::default()
    };
    let (options, sections) =
        apply_render_params(&DashboardOptions::default(), &Sections::default(), &params)
            .expect("valid params");
    assert_eq!(options.days_back, 14);
    assert_eq!(options.top_n, 3);
    assert!(sections.anomaly_detection);
    assert!(!sections.forecast);
    assert!(sections.summary);
}

#[test]
fn missing_params_keep_configuration() {
    let base = DashboardOptions {
        days_back: 60,
        ..DashboardOptions::default()
    };
    let (options, sections) =
        apply_render_params(&base, &Sections::NONE, &RenderParams::default()).expect("valid");
    assert_eq!(options, base);
    assert_eq!(sections, Sections::NONE);
}

#[test]
fn out_of_range_params_are_rejected() {
    let too_short = RenderParams {
        days: Some(3),
        ..RenderParams::default()
    };
    let err = apply_render_params(&DashboardOptions::default(), &Sections::default(), &too_short)
        .expect_err("days below slider range");
    assert!(err.contains("days_back"));

    let zero_top = RenderParams {
        top: Some(0),
        ..RenderParams::default()
    };
    assert!(
        apply_render_params(&DashboardOptions::default(), &Sections::default(), &zero_top)
            .is_err()
    );
}
