//! Property tests over the engine's public types.

use proptest::prelude::*;

use fieldsync::sync::expected_transfer;
use fieldsync::{Announcement, Target, TargetStatus, Targets, DEFAULT_SERVICE_TYPE};
use fieldsync_testkit::generators;

proptest! {
    #[test]
    fn test_transfer_is_symmetric(
        local in generators::log_lengths(8),
        remote in generators::log_lengths(8),
    ) {
        let ours = expected_transfer(&local, &remote);
        let theirs = expected_transfer(&remote, &local);
        prop_assert_eq!(ours.download, theirs.upload);
        prop_assert_eq!(ours.upload, theirs.download);
    }

    #[test]
    fn test_announcements_round_trip_through_targets(
        id in generators::device_id(),
        device_type in generators::device_type(),
        port in 1u16..,
    ) {
        let announcement = Announcement {
            name: id.to_hex(),
            host: "10.0.0.2".to_string(),
            port,
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            device_name: "field laptop".to_string(),
            device_type,
        };
        let json = serde_json::to_string(&announcement).unwrap();
        let parsed: Announcement = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(&parsed, &announcement);

        let targets = Targets::new();
        targets.upsert(&parsed);
        prop_assert_eq!(
            targets.get(&id.to_hex()),
            Some(Target {
                id: id.to_hex(),
                name: "field laptop".to_string(),
                host: "10.0.0.2".to_string(),
                port,
                status: TargetStatus::Idle,
                device_type,
            })
        );
    }
}
