//! Wire-format properties: round-trips, canonical hashing and scrubbing.

use bitcoin::hashes::{sha256, Hash};
use proptest::prelude::*;

use lighthouse::pledge::Pledge;
use lighthouse::wire::{
    self, ExtraDetails, Output, PledgeDetails, PledgeSpecifics, ProjectDetails, ProjectMessage,
    ProjectStatus,
};

fn output_strategy() -> impl Strategy<Value = Output> {
    (1u64..=10_000_000_000, proptest::collection::vec(any::<u8>(), 1..64))
        .prop_map(|(amount, script)| Output { amount, script })
}

fn pledge_strategy() -> impl Strategy<Value = PledgeDetails> {
    (
        proptest::collection::vec(any::<u8>(), 32),
        1u64..=10_000_000_000,
        any::<u64>(),
        proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..256), 1..3),
        proptest::option::of(".*"),
        proptest::option::of(".*"),
    )
        .prop_map(|(project_id, total, timestamp, transactions, name, memo)| PledgeDetails {
            project_id,
            total_input_value: total,
            timestamp,
            transactions,
            pledge_details: Some(PledgeSpecifics { memo, name, contact_address: None }),
            orig_hash: None,
        })
}

fn project_strategy() -> impl Strategy<Value = ProjectDetails> {
    (
        proptest::option::of(prop_oneof!["main", "test", "regtest"]),
        proptest::collection::vec(output_strategy(), 1..4),
        any::<u64>(),
        proptest::option::of(".*"),
        proptest::collection::vec(any::<u8>(), 33),
        1u64..=100_000_000,
    )
        .prop_map(|(network, outputs, time, memo, auth_key, min_pledge)| ProjectDetails {
            network: network.map(Into::into),
            outputs,
            time,
            memo,
            extra_details: Some(ExtraDetails {
                title: "t".into(),
                cover_image: None,
                auth_key,
                min_pledge_size: min_pledge,
            }),
            ..Default::default()
        })
}

proptest! {
    #[test]
    fn pledge_roundtrips(details in pledge_strategy()) {
        let bytes = wire::encode_delimited(&details);
        let back: PledgeDetails = wire::decode_delimited(&bytes).unwrap();
        prop_assert_eq!(details, back);
    }

    #[test]
    fn project_roundtrips(details in project_strategy()) {
        let msg = ProjectMessage::from_details(&details);
        let bytes = wire::encode_delimited(&msg);
        let back: ProjectMessage = wire::decode_delimited(&bytes).unwrap();
        prop_assert_eq!(&msg, &back);
        prop_assert_eq!(msg.id_hash(), back.id_hash());
        prop_assert_eq!(details, back.details().unwrap());
    }

    #[test]
    fn scrubbing_commits_to_the_full_form(details in pledge_strategy()) {
        let full = Pledge::from_details(details);
        let scrubbed = full.scrub();
        prop_assert!(scrubbed.details().transactions.is_empty());
        let expected = sha256::Hash::hash(full.encoded());
        prop_assert_eq!(
            scrubbed.details().orig_hash.as_deref(),
            Some(expected.as_byte_array().as_slice())
        );
        // Scrubbing keeps the identity and is idempotent.
        prop_assert_eq!(scrubbed.identity(), full.identity());
        let rescrubbed = scrubbed.scrub();
        prop_assert_eq!(rescrubbed.encoded(), scrubbed.encoded());
    }
}

#[test]
fn status_roundtrips() {
    let status = ProjectStatus {
        id: vec![9; 32],
        timestamp: 1_700_000_000,
        value_pledged_so_far: 42,
        pledges: vec![PledgeDetails {
            project_id: vec![9; 32],
            total_input_value: 42,
            timestamp: 5,
            transactions: vec![],
            pledge_details: None,
            orig_hash: Some(vec![1; 32]),
        }],
        claimed_by: Some(vec![3; 32]),
    };
    let bytes = wire::encode_delimited(&status);
    let back: ProjectStatus = wire::decode_delimited(&bytes).unwrap();
    assert_eq!(status, back);
}

#[test]
fn truncated_messages_are_rejected() {
    let details = PledgeDetails {
        project_id: vec![7; 32],
        total_input_value: 1,
        timestamp: 1,
        transactions: vec![vec![1, 2, 3]],
        pledge_details: None,
        orig_hash: None,
    };
    let bytes = wire::encode_delimited(&details);
    assert!(wire::decode_delimited::<PledgeDetails>(&bytes[..bytes.len() - 2]).is_err());
}
