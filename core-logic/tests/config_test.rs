use core_logic::{ConfigError, Node, SecurityLevel, Summary, Tally};
use std::time::Duration;

#[test]
fn test_node_attach_flag_defaults_off() {
    let node: Node = serde_json::from_str(r#"{"url":"http://localhost:14265"}"#).unwrap();
    assert_eq!(node, Node::new("http://localhost:14265", false));
    assert_eq!(node.to_string(), "http://localhost:14265");

    let remote = Node::new("http://localhost:14265", true);
    assert_eq!(remote.to_string(), "http://localhost:14265 (remote PoW)");
}

#[test]
fn test_security_level_bounds() {
    assert_eq!(SecurityLevel::default(), SecurityLevel::Medium);
    assert_eq!(SecurityLevel::try_from(3).unwrap(), SecurityLevel::High);
    assert!(matches!(
        SecurityLevel::try_from(4),
        Err(ConfigError::InvalidValue { .. })
    ));

    let parsed: Result<SecurityLevel, _> = serde_json::from_str("0");
    assert!(parsed.is_err());
    assert_eq!(serde_json::to_string(&SecurityLevel::Low).unwrap(), "1");
}

#[test]
fn test_summary_serializes_flat() {
    let tally = Tally {
        succeeded: 3,
        failed: 1,
        cached: 2,
        fetched: 4,
        ..Default::default()
    };
    let summary = tally.summary(Duration::from_secs(3));
    let json = serde_json::to_value(&summary).unwrap();

    assert_eq!(json["txs_succeeded"], 3);
    assert_eq!(json["tps"], 1.0);
    assert_eq!(json["error_rate"], 25.0);
    assert_eq!(json["cached_tx"], 2);
    assert_eq!(json["new_tx"], 4);

    let back: Summary = serde_json::from_value(json).unwrap();
    assert_eq!(back, summary);
}
