use std::path::{Path, PathBuf};

use procman::config::{Ecosystem, WatchConfig, load_config};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn assert_canonical(ecosystem: &Ecosystem) {
    assert_eq!(ecosystem.apps().len(), 1);

    let app = &ecosystem.apps()[0];
    assert_eq!(app.name, "myapp");
    assert_eq!(app.script, "app.js");
    assert_eq!(app.watch, WatchConfig::Flag(true));

    assert_eq!(app.env.len(), 2);
    assert_eq!(app.env.get("PORT").map(String::as_str), Some("3000"));
    assert_eq!(
        app.env.get("NODE_ENV").map(String::as_str),
        Some("development")
    );

    let production = app.env_for_mode("production").expect("env_production");
    assert_eq!(production.len(), 1);
    assert_eq!(
        production.get("NODE_ENV").map(String::as_str),
        Some("production")
    );
}

#[test]
fn yaml_ecosystem_matches_declared_shape() {
    let ecosystem = load_config(Some(&fixture("ecosystem.config.yaml"))).unwrap();
    assert_canonical(&ecosystem);
}

#[test]
fn json_ecosystem_matches_declared_shape() {
    let ecosystem = load_config(Some(&fixture("ecosystem.config.json"))).unwrap();
    assert_canonical(&ecosystem);
}

#[test]
fn production_mode_overrides_default_env() {
    let ecosystem = load_config(Some(&fixture("ecosystem.config.yaml"))).unwrap();
    let plans = ecosystem.launch_plans(Some("production"));
    let plan = &plans[0];

    assert_eq!(plan.name, "myapp");
    assert_eq!(plan.program, "node");
    assert_eq!(
        plan.args,
        vec![fixture("app.js").to_string_lossy().into_owned()]
    );
    assert_eq!(plan.cwd, fixture(""));
    assert_eq!(plan.env.get("PORT").map(String::as_str), Some("3000"));
    assert_eq!(
        plan.env.get("NODE_ENV").map(String::as_str),
        Some("production")
    );
}

#[test]
fn default_mode_watches_config_directory() {
    let ecosystem = load_config(Some(&fixture("ecosystem.config.yaml"))).unwrap();
    let app = ecosystem.app("myapp").unwrap();

    assert_eq!(
        app.watch_roots(ecosystem.project_dir()),
        vec![fixture("")]
    );
    assert_eq!(
        app.resolve_env(None).get("NODE_ENV").map(String::as_str),
        Some("development")
    );
}

#[test]
fn only_narrows_to_named_app() {
    let ecosystem = load_config(Some(&fixture("ecosystem.config.yaml"))).unwrap();
    assert_eq!(ecosystem.clone().only("myapp").unwrap().apps().len(), 1);
    assert!(ecosystem.only("other").is_err());
}
