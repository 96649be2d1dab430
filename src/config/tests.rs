use serial_test::serial;

use super::*;

#[test]
fn defaults_resolve() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.to_string(), "127.0.0.1:3000");
    assert_eq!(settings.server.graceful_shutdown, Duration::from_secs(30));
    assert_eq!(settings.cache.backend, CacheBackend::Sqlite);
    assert_eq!(settings.cache.path, PathBuf::from("./.cache.db"));
    assert_eq!(settings.cache.tbd, Duration::from_secs(3600));
    assert!(!settings.cache.durable_stats);
    assert_eq!(settings.rules.len(), 1);
    assert_eq!(settings.rules[0].ttl(), Duration::from_secs(3600));
    assert_eq!(settings.lock.lease, Duration::from_secs(10));
    assert_eq!(settings.lock.poll_interval, Duration::from_millis(10));
    assert_eq!(settings.lock.wait_budget, Duration::from_secs(10));
    assert_eq!(settings.renderer.mode, RendererMode::Thread);
    assert_eq!(settings.renderer.upstream.as_str(), "http://127.0.0.1:3001/");
    assert!(settings.metrics.enabled);
    assert_eq!(settings.metrics.path, "/__nextboost_metrics");
    assert_eq!(settings.headers.force.as_str(), "x-next-boost");
    assert_eq!(settings.headers.status.as_str(), "x-next-boost-status");
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.cache.backend = Some("sqlite".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        cache_backend: Some("memory".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.cache.backend, CacheBackend::Memory);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["next-boost"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_arguments() {
    let args = CliArgs::parse_from([
        "next-boost",
        "serve",
        "--upstream",
        "http://10.0.0.2:8080",
        "--renderer-mode",
        "process",
        "--metrics-enabled",
        "false",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(
                serve.overrides.upstream.as_deref(),
                Some("http://10.0.0.2:8080")
            );
            assert_eq!(serve.overrides.renderer_mode.as_deref(), Some("process"));
            assert_eq!(serve.overrides.metrics_enabled, Some(false));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn worker_subcommand_parses() {
    let args = CliArgs::parse_from(["next-boost", "worker"]);
    assert!(matches!(args.command, Some(Command::Worker)));
}

#[test]
fn rules_keep_order_and_fractional_ttls() {
    let raw = RawSettings {
        rules: Some(vec![
            RawRule {
                regex: "^/p1$".to_string(),
                ttl: 1.0,
            },
            RawRule {
                regex: "^/news".to_string(),
                ttl: 0.5,
            },
        ]),
        ..Default::default()
    };

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.rules.len(), 2);
    assert_eq!(settings.rules[0].ttl(), Duration::from_secs(1));
    assert_eq!(settings.rules[1].ttl(), Duration::from_millis(500));
}

#[test]
fn invalid_rule_is_rejected() {
    let raw = RawSettings {
        rules: Some(vec![RawRule {
            regex: "(".to_string(),
            ttl: 1.0,
        }]),
        ..Default::default()
    };

    let err = Settings::from_raw(raw).expect_err("broken regex");
    assert!(matches!(err, LoadError::Invalid { key: "rules", .. }));
}

#[test]
fn unknown_backend_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.backend = Some("memcached".to_string());

    let err = Settings::from_raw(raw).expect_err("unknown backend");
    assert!(matches!(err, LoadError::Invalid { key: "cache.backend", .. }));
}

#[test]
fn zero_lock_budget_is_rejected() {
    let mut raw = RawSettings::default();
    raw.lock.wait_budget_ms = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero budget");
    assert!(matches!(err, LoadError::Invalid { key: "lock.wait_budget_ms", .. }));
}

#[test]
fn upstream_must_be_http() {
    let mut raw = RawSettings::default();
    raw.renderer.upstream = Some("ftp://origin".to_string());

    let err = Settings::from_raw(raw).expect_err("ftp upstream");
    assert!(matches!(err, LoadError::Invalid { key: "renderer.upstream", .. }));
}

#[test]
fn metrics_path_must_be_absolute() {
    let mut raw = RawSettings::default();
    raw.metrics.path = Some("metrics".to_string());

    let err = Settings::from_raw(raw).expect_err("relative path");
    assert!(matches!(err, LoadError::Invalid { key: "metrics.path", .. }));
}

#[test]
fn param_excludes_are_trimmed() {
    let raw = RawSettings {
        params: RawParamSettings {
            exclude: Some(vec![" utm_* ".to_string(), String::new(), "fbclid".to_string()]),
        },
        ..Default::default()
    };

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.params.exclude, vec!["utm_*", "fbclid"]);
}

#[test]
#[serial]
fn loads_rules_from_config_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("custom.toml");
    std::fs::write(
        &path,
        r#"
[cache]
backend = "memory"
tbd_seconds = 5

[[rules]]
regex = "^/p1$"
ttl = 1

[params]
exclude = ["utm_*"]
"#,
    )
    .expect("write config");

    let args = CliArgs::parse_from([
        "next-boost",
        "--config-file",
        path.to_str().expect("utf-8 path"),
    ]);
    let settings = load(&args).expect("settings load");

    assert_eq!(settings.cache.backend, CacheBackend::Memory);
    assert_eq!(settings.cache.tbd, Duration::from_secs(5));
    assert_eq!(settings.rules.len(), 1);
    assert_eq!(settings.rules[0].ttl(), Duration::from_secs(1));
    assert_eq!(settings.params.exclude, vec!["utm_*"]);
}

#[test]
#[serial]
fn environment_overrides_defaults() {
    // SAFETY: serialised with every other test that reads the environment.
    unsafe {
        std::env::set_var("NEXT_BOOST__SERVER__PORT", "4555");
        std::env::set_var("NEXT_BOOST__CACHE__BACKEND", "memory");
    }
    let args = CliArgs::parse_from(["next-boost", "serve", "--server-port", "4666"]);
    let loaded = load(&args);
    unsafe {
        std::env::remove_var("NEXT_BOOST__SERVER__PORT");
        std::env::remove_var("NEXT_BOOST__CACHE__BACKEND");
    }

    let settings = loaded.expect("settings load");
    assert_eq!(settings.server.addr.port(), 4666);
    assert_eq!(settings.cache.backend, CacheBackend::Memory);
}
