//! Property-based checks over the wire codec, the tag monitor, and the
//! phase-dependent validation policy.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use proptest::prelude::*;

use alilcd::commands::Cdb;
use alilcd::lifecycle::Phase;
use alilcd::protocol::{Cbw, Csw, Direction, CSW_LEN, CSW_SIGNATURE};
use alilcd::tag::TagMonitor;
use alilcd::transport::{ExecOptions, Transport};

use common::{parse_cbw, ExchangePlan, MockGateway};

fn direction() -> impl Strategy<Value = Direction> {
    prop_oneof![
        Just(Direction::In),
        Just(Direction::Out),
        Just(Direction::None),
    ]
}

proptest! {
    // Encoding a CBW and reading the frame back yields the original
    // fields, with the CDB zero-padded past its real length.
    #[test]
    fn cbw_round_trips(
        tag in any::<u32>(),
        len in any::<u32>(),
        dir in direction(),
        cdb in prop::collection::vec(any::<u8>(), 1..=16),
    ) {
        let frame = Cbw::new(tag, dir, len, &cdb).encode();
        let parsed = parse_cbw(&frame).expect("encoded frame must parse");
        prop_assert_eq!(parsed.tag, tag);
        prop_assert_eq!(parsed.transfer_length, len);
        prop_assert_eq!(parsed.flags & 0x80 != 0, dir == Direction::In);
        prop_assert_eq!(parsed.lun, 0);
        prop_assert_eq!(parsed.cdb, cdb);
    }

    // Any buffer that is not exactly 13 bytes is rejected.
    #[test]
    fn csw_decode_rejects_wrong_length(buf in prop::collection::vec(any::<u8>(), 0..64)) {
        prop_assume!(buf.len() != CSW_LEN);
        prop_assert!(Csw::decode(&buf).is_err());
    }

    // A 13-byte buffer decodes exactly when it carries the signature.
    #[test]
    fn csw_decode_checks_signature(
        tag in any::<u32>(),
        residue in any::<u32>(),
        status in any::<u8>(),
        sig in any::<u32>(),
    ) {
        let mut frame = Csw { tag, data_residue: residue, status }.encode();
        frame[0..4].copy_from_slice(&sig.to_le_bytes());
        let decoded = Csw::decode(&frame);
        if sig == CSW_SIGNATURE {
            let csw = decoded.unwrap();
            prop_assert_eq!(csw.tag, tag);
            prop_assert_eq!(csw.data_residue, residue);
            prop_assert_eq!(csw.status, status);
        } else {
            prop_assert!(decoded.is_err());
        }
    }

    // Allocated tags are strictly increasing and never repeat within the
    // history horizon.
    #[test]
    fn tags_strictly_increase_without_reuse(n in 1usize..300) {
        let mut mon = TagMonitor::new();
        let tags: Vec<u32> = (0..n).map(|_| mon.next(Phase::Connected)).collect();
        for pair in tags.windows(2) {
            prop_assert!(pair[1] > pair[0]);
        }
        let unique: HashSet<&u32> = tags.iter().collect();
        prop_assert_eq!(unique.len(), tags.len());
    }
}

proptest! {
    // Driving the whole transport is slower than the pure checks above;
    // a smaller case count still covers the policy well.
    #![proptest_config(ProptestConfig::with_cases(16))]

    // While the animation runs, no stream of garbage tags may ever fail a
    // command: mismatches are recorded, rebased, or ignored, never
    // surfaced.
    #[test]
    fn animation_phase_never_fails_on_random_tags(
        echoes in prop::collection::vec(any::<u32>(), 1..32),
    ) {
        let mut config = common::fast_config();
        // Pin the lifecycle in Animation for the whole run.
        config.lifecycle.animation_min_elapsed = Duration::from_secs(3600);

        let script = echoes.clone();
        let mut i = 0usize;
        let mock = MockGateway::new(move |_| {
            let tag = script[i % script.len()];
            i += 1;
            ExchangePlan::with_tag(tag)
        });
        let transport = Transport::with_gateway(mock, config);

        let tur = Cdb::TestUnitReady.bytes();
        let opts = ExecOptions::default();
        for _ in 0..echoes.len() {
            let result = transport.execute(&tur, Direction::None, None, 0, &opts);
            prop_assert!(result.is_ok(), "animation-phase execute failed: {:?}", result.err());
        }
    }
}
