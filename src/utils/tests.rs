use super::error::{DeclareError, TransportError};
use super::logging;

#[test]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
fn unknown_levels_fall_back_to_info() {
    assert_eq!(logging::level_for("WARNING"), "warn");
    assert_eq!(logging::level_for("Trace"), "trace");
    assert_eq!(logging::level_for("loud"), "info");
}

#[test]
fn only_network_failures_are_transient() {
    assert!(TransportError::Unreachable("refused".into()).is_transient());
    assert!(TransportError::Timeout(std::time::Duration::from_secs(1)).is_transient());
    assert!(!TransportError::AccessRefused("bad password".into()).is_transient());
    assert!(!TransportError::ConnectionLost("reset".into()).is_transient());
    assert!(TransportError::ConnectionLost("reset".into()).is_connection_loss());
    assert!(!TransportError::Nacked.is_connection_loss());
}

#[test]
fn declare_errors_are_classified_by_cause() {
    let conflict = DeclareError::from(TransportError::QueueConflict {
        queue: "first_names".into(),
        reason: "durable mismatch".into(),
    });
    assert!(matches!(conflict, DeclareError::Conflict(_)));

    let lost = DeclareError::from(TransportError::ConnectionLost("closed".into()));
    assert!(matches!(lost, DeclareError::ConnectionLost(_)));

    let other = DeclareError::from(TransportError::Protocol("NOT_ALLOWED".into()));
    assert!(matches!(other, DeclareError::Other(_)));
}

#[test]
fn publish_errors_split_lost_from_refused() {
    use super::error::PublishError;

    assert!(matches!(
        PublishError::from(TransportError::ConnectionLost("reset".into())),
        PublishError::ConnectionLost(_)
    ));
    assert!(matches!(
        PublishError::from(TransportError::Unroutable("first_names".into())),
        PublishError::Rejected(_)
    ));
}
