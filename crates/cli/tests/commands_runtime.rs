use std::env;
use std::sync::{Mutex, OnceLock};

use dealdesk_cli::commands::{audit, config, deal, doctor, migrate, status};
use serde_json::Value;
use tempfile::TempDir;

const SIGNING_KEY: &str = "cli-runtime-test-signing-key-0123456789";

#[test]
fn migrate_returns_success_with_valid_env() {
    with_database(|vars| {
        with_env(&vars[..], || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 0, "expected successful migrate run");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "migrate");
            assert_eq!(payload["status"], "ok");
            assert_eq!(payload["data"]["applied_versions"], serde_json::json!([1]));
        });
    });
}

#[test]
fn migrate_returns_config_failure_without_approver() {
    with_env(&[("DEALDESK_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn set_base_then_audit_shows_the_change() {
    with_database(|vars| {
        with_env(&vars[..], || {
            let set = deal::set_base("D-100", "100000", "ops-lead");
            assert_eq!(set.exit_code, 0, "unexpected output: {}", set.output);
            let payload = parse_payload(&set.output);
            assert_eq!(payload["data"]["base_total"], "100000");
            assert_eq!(payload["data"]["final_total"], "100000");

            let trail = audit::run("D-100");
            assert_eq!(trail.exit_code, 0);
            let payload = parse_payload(&trail.output);
            let entries = payload["data"].as_array().cloned().unwrap_or_default();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0]["action"], "deal.base_total_set");
            assert_eq!(entries[0]["actor_id"], "ops-lead");
        });
    });
}

#[test]
fn set_base_rejects_malformed_amount() {
    with_database(|vars| {
        with_env(&vars[..], || {
            let result = deal::set_base("D-100", "a lot", "ops");
            assert_eq!(result.exit_code, 7);
            let payload = parse_payload(&result.output);
            assert_eq!(payload["error_class"], "validation");
        });
    });
}

#[test]
fn status_of_unknown_request_is_not_found() {
    with_database(|vars| {
        with_env(&vars[..], || {
            let result = status::run("DAR-does-not-exist");
            assert_eq!(result.exit_code, 7);

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "status");
            assert_eq!(payload["error_class"], "not_found");
        });
    });
}

#[test]
fn doctor_reports_pending_migrations_then_passes() {
    with_database(|vars| {
        with_env(&vars[..], || {
            let before = parse_payload(&doctor::run(true));
            assert_eq!(before["overall_status"], "fail");
            let schema = before["checks"]
                .as_array()
                .and_then(|checks| checks.iter().find(|check| check["name"] == "schema_migrations"))
                .cloned()
                .unwrap_or(Value::Null);
            assert_eq!(schema["status"], "fail");

            assert_eq!(migrate::run().exit_code, 0);

            let after = parse_payload(&doctor::run(true));
            assert_eq!(after["overall_status"], "pass");
        });
    });
}

#[test]
fn doctor_skips_checks_when_config_is_invalid() {
    with_env::<&str>(&[], || {
        let report = parse_payload(&doctor::run(true));
        assert_eq!(report["overall_status"], "fail");
        let statuses: Vec<String> = report["checks"]
            .as_array()
            .map(|checks| {
                checks.iter().map(|check| check["status"].as_str().unwrap_or("").to_string()).collect()
            })
            .unwrap_or_default();
        assert_eq!(statuses, vec!["fail", "skipped", "skipped", "skipped"]);
    });
}

#[test]
fn config_output_redacts_signing_key() {
    with_database(|vars| {
        with_env(&vars[..], || {
            let output = config::run();
            assert!(output.contains("approval.token_signing_key = <redacted>"));
            assert!(output.contains("(source: env (DEALDESK_APPROVAL_APPROVER_ID))"));
            assert!(!output.contains(SIGNING_KEY));
        });
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_database(test_fn: impl FnOnce(Vec<(&'static str, String)>)) {
    let dir = TempDir::new().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("dealdesk.db").display());
    test_fn(vec![
        ("DEALDESK_DATABASE_URL", url),
        ("DEALDESK_APPROVAL_APPROVER_ID", "vp@example.com".to_string()),
        ("DEALDESK_APPROVAL_TOKEN_SIGNING_KEY", SIGNING_KEY.to_string()),
    ]);
}

fn with_env<V: AsRef<str>>(vars: &[(&str, V)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    let keys = [
        "DEALDESK_DATABASE_URL",
        "DEALDESK_DATABASE_MAX_CONNECTIONS",
        "DEALDESK_DATABASE_TIMEOUT_SECS",
        "DEALDESK_SERVER_BIND_ADDRESS",
        "DEALDESK_SERVER_PORT",
        "DEALDESK_APPROVAL_APPROVER_ID",
        "DEALDESK_APPROVAL_APPROVER_EMAIL",
        "DEALDESK_APPROVAL_TOKEN_SIGNING_KEY",
        "DEALDESK_APPROVAL_MAX_CODE_ATTEMPTS",
        "DEALDESK_NOTIFIER_KIND",
        "DEALDESK_NOTIFIER_RELAY_URL",
        "DEALDESK_NOTIFIER_RELAY_API_KEY",
        "DEALDESK_LOGGING_LEVEL",
        "DEALDESK_LOGGING_FORMAT",
        "DEALDESK_LOG_LEVEL",
        "DEALDESK_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value.as_ref());
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
