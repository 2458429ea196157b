//! Safety Limits Integration Tests
//!
//! Document size limits, denylist patterns and step-execution caps.

use gampflow::config::WorkflowConfig;
use gampflow::core::{SafetyLimits, SafetyTracker, SafetyViolation};
use std::path::Path;

#[test]
fn test_max_document_bytes() {
    let limits = SafetyLimits {
        max_document_bytes: 100,
        ..Default::default()
    };

    assert!(limits.validate_document(&"x".repeat(50), None).is_ok());

    // At the limit is still fine
    assert!(limits.validate_document(&"x".repeat(100), None).is_ok());

    match limits.validate_document(&"x".repeat(200), None) {
        Err(SafetyViolation::MaxDocumentBytes { actual, limit }) => {
            assert_eq!(actual, 200);
            assert_eq!(limit, 100);
        }
        other => panic!("Expected MaxDocumentBytes violation, got {:?}", other),
    }
}

#[test]
fn test_denylist_pattern_env() {
    let limits = SafetyLimits::default();

    assert!(limits.is_denylisted(".env"));
    assert!(limits.is_denylisted(".env.production"));
    assert!(limits.is_denylisted("validation/.env"));
}

#[test]
fn test_denylist_pattern_secrets_and_credentials() {
    let limits = SafetyLimits::default();

    assert!(limits.is_denylisted("secrets.yaml"));
    assert!(limits.is_denylisted("deep/path/secrets-file"));
    assert!(limits.is_denylisted("lims_credentials.txt"));

    // **/secrets* matches names that start with "secrets"
    assert!(!limits.is_denylisted("my-secrets-file"));
}

#[test]
fn test_denylist_pattern_keys() {
    let limits = SafetyLimits::default();

    assert!(limits.is_denylisted("server.pem"));
    assert!(limits.is_denylisted("ssl/domain.key"));
}

#[test]
fn test_denylist_allows_requirement_documents() {
    let limits = SafetyLimits::default();

    assert!(!limits.is_denylisted("urs-017.md"));
    assert!(!limits.is_denylisted("specs/functional-spec.txt"));
    assert!(!limits.is_denylisted("README.md"));
}

#[test]
fn test_validate_document_with_denylisted_path() {
    let limits = SafetyLimits::default();
    let content = "The system shall record batch release decisions.";

    assert!(limits
        .validate_document(content, Some(Path::new("specs/urs-017.md")))
        .is_ok());

    match limits.validate_document(content, Some(Path::new(".env.local"))) {
        Err(SafetyViolation::DenylistMatch { path }) => assert!(path.contains(".env.local")),
        other => panic!("Expected DenylistMatch violation, got {:?}", other),
    }
}

#[test]
fn test_max_step_executions_enforcement() {
    let limits = SafetyLimits {
        max_step_executions: 3,
        ..Default::default()
    };

    let mut tracker = SafetyTracker::new();
    for _ in 0..3 {
        assert!(limits.check(&tracker).is_ok());
        tracker.record_execution();
    }

    match limits.check(&tracker) {
        Err(SafetyViolation::MaxStepExecutions { actual, limit }) => {
            assert_eq!(actual, 3);
            assert_eq!(limit, 3);
        }
        other => panic!("Expected MaxStepExecutions violation, got {:?}", other),
    }
}

#[test]
fn test_custom_denylist_patterns() {
    let limits = SafetyLimits {
        denylist_patterns: vec!["**/*.secret".to_string(), "**/private/*".to_string()],
        ..Default::default()
    };

    assert!(limits.is_denylisted("config.secret"));
    assert!(limits.is_denylisted("data/private/urs.md"));

    // Default patterns are replaced, not merged
    assert!(!limits.is_denylisted(".env"));
}

#[test]
fn test_safety_limits_yaml_parsing() {
    let yaml = r#"
limits:
  max_step_executions: 10
  max_document_bytes: 1048576
  step_timeout_seconds: 60
  collect_timeout_seconds: 120
  run_timeout_seconds: 600
  denylist_patterns:
    - "**/*.password"
    - "**/api_keys/*"
"#;

    let config: WorkflowConfig = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(config.limits.max_step_executions, 10);
    assert_eq!(config.limits.max_document_bytes, 1048576);
    assert_eq!(config.limits.step_timeout_seconds, 60);
    assert_eq!(config.limits.collect_timeout_seconds, 120);
    assert_eq!(config.limits.run_timeout_seconds, 600);
    assert_eq!(config.limits.denylist_patterns.len(), 2);
}

#[test]
fn test_safety_limits_default_values() {
    let limits = SafetyLimits::default();

    assert_eq!(limits.max_step_executions, 100);
    assert_eq!(limits.max_document_bytes, 10 * 1024 * 1024); // 10MB
    assert_eq!(limits.step_timeout_seconds, 300); // 5 min
    assert_eq!(limits.collect_timeout_seconds, 600); // 10 min
    assert_eq!(limits.run_timeout_seconds, 3600); // 1 hour
}
