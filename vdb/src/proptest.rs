// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests for the route target list codec.

#[cfg(test)]
mod proptest {
    use crate::rtrd::{decode, encode, validate};
    use proptest::prelude::*;

    // Route target shaped values: "<asn>:<n>" or "<ip>:<n>".
    fn target_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            (any::<u32>(), any::<u16>()).prop_map(|(a, n)| format!("{a}:{n}")),
            (any::<[u8; 4]>(), any::<u16>()).prop_map(|(ip, n)| {
                format!("{}.{}.{}.{}:{n}", ip[0], ip[1], ip[2], ip[3])
            }),
        ]
    }

    // Arbitrary non-empty values without the separator.
    fn value_strategy() -> impl Strategy<Value = String> {
        "[^,]{1,24}"
    }

    proptest! {
        /// Property: decoding an encoded list yields the original list
        #[test]
        fn prop_decode_inverts_encode(
            targets in prop::collection::vec(value_strategy(), 0..16)
        ) {
            prop_assert_eq!(decode(Some(encode(&targets).as_str())), targets);
        }

        /// Property: encoding preserves order and duplicates
        #[test]
        fn prop_order_and_duplicates_preserved(
            target in target_strategy(),
            other in target_strategy(),
        ) {
            let list = vec![target.clone(), other, target];
            let decoded = decode(Some(encode(&list).as_str()));
            prop_assert_eq!(decoded.len(), 3);
            prop_assert_eq!(decoded, list);
        }

        /// Property: encoding a decoded non-empty string yields the string
        #[test]
        fn prop_encode_inverts_decode(
            targets in prop::collection::vec(target_strategy(), 1..16)
        ) {
            let s = targets.join(",");
            prop_assert_eq!(encode(&decode(Some(s.as_str()))), s);
        }

        /// Property: valid values always pass validation
        #[test]
        fn prop_targets_validate(
            targets in prop::collection::vec(target_strategy(), 0..16)
        ) {
            prop_assert!(validate("route_targets", &targets).is_ok());
        }

        /// Property: any value containing the separator is rejected
        #[test]
        fn prop_separator_rejected(
            left in value_strategy(),
            right in value_strategy(),
        ) {
            let bad = vec![format!("{left},{right}")];
            prop_assert!(validate("route_targets", &bad).is_err());
        }
    }
}
