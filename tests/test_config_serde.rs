use libphotoncorr::configuration::{AppConfig, AppConfigBuilder};
use libphotoncorr::histogram::Scale;
use libphotoncorr::photon::RecordMode;

#[test]
fn config_ser_deser_returns_identical() {
    let cfg = AppConfigBuilder::default().build();
    let stringified = toml::to_string(&cfg).unwrap();
    let ret: AppConfig = toml::from_str(&stringified).unwrap();
    assert_eq!(ret, cfg);
}

#[test]
fn customized_config_survives_a_roundtrip() {
    let cfg = AppConfigBuilder::default()
        .with_mode(RecordMode::T2)
        .with_channels(8)
        .with_number(Some(1_000_000))
        .with_log_file(Some("photoncorr.log".into()))
        .with_reverse_histogram_channels(true)
        .with_scale(Scale::LogZero)
        .with_limits(1.0, 1e9)
        .build();
    let stringified = toml::to_string(&cfg).unwrap();
    assert!(stringified.contains("[histogram]"));
    let ret: AppConfig = toml::from_str(&stringified).unwrap();
    assert_eq!(ret, cfg);
    assert!(ret.validate().is_ok());
}
