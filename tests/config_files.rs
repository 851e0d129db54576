use std::io::Write;
use tempfile::NamedTempFile;
use umbra::cli::CliOverrides;
use umbra::config::{AppConfig, ShadowResolution};

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn shipped_config_matches_defaults() {
    let config = AppConfig::load("config/app.json").expect("shipped config");
    let defaults = AppConfig::default();
    assert_eq!(config.shadow.split_fractions, defaults.shadow.split_fractions);
    assert_eq!(config.shadow.resolution, ShadowResolution::High);
    assert_eq!(config.light_direction, defaults.light_direction);
    assert_eq!((config.window.width, config.window.height), (1280, 720));
}

#[test]
fn file_values_then_cli_overrides_apply() {
    let file = write_config(
        r#"{
            "window": { "width": 800, "height": 600 },
            "shadow": { "resolution": "low", "split_fractions": [0.1, 0.3] },
            "render": { "exposure": 2.5 }
        }"#,
    );
    let mut config = AppConfig::load(file.path()).expect("load");
    assert_eq!(config.shadow.resolution.texels(), 512);
    assert_eq!(config.shadow.cascade_count(), 3);
    assert_eq!(config.render.exposure, 2.5);
    assert!(config.window.vsync, "unspecified window fields keep defaults");

    let cli = CliOverrides::parse(["umbra", "--width", "1920", "--shadow-resolution", "extreme"]).expect("cli");
    config.apply_overrides(&cli.into_config_overrides());
    assert_eq!((config.window.width, config.window.height), (1920, 600));
    assert_eq!(config.shadow.resolution.texels(), 8192);
}

#[test]
fn invalid_files_are_rejected_by_load_and_replaced_by_load_or_default() {
    let vertical = write_config(r#"{ "light_direction": [0.0, 1.0, 0.0] }"#);
    let err = AppConfig::load(vertical.path()).expect_err("vertical light");
    assert!(format!("{err:#}").contains("parallel to world up"));

    let malformed = write_config("{ not json");
    assert!(AppConfig::load(malformed.path()).is_err());
    let fallback = AppConfig::load_or_default(malformed.path());
    assert_eq!(fallback.shadow.split_fractions, AppConfig::default().shadow.split_fractions);
}

#[test]
fn too_many_splits_are_rejected() {
    let fractions: Vec<String> = (1..=16).map(|i| format!("{}", i as f32 / 20.0)).collect();
    let file = write_config(&format!(r#"{{ "shadow": {{ "split_fractions": [{}] }} }}"#, fractions.join(", ")));
    assert!(AppConfig::load(file.path()).is_err());
}
