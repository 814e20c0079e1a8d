//! Property tests for the pure serialization and domain logic.

use lancet::storage::vector::{deserialize_embedding, serialize_embedding};
use lancet::utils::registrable_domain;
use proptest::prelude::*;

proptest! {
    #[test]
    fn embedding_blob_round_trips(vec in proptest::collection::vec(-1000.0f32..1000.0, 0..256)) {
        let blob = serialize_embedding(&vec);
        prop_assert_eq!(blob.len(), vec.len() * 4);
        prop_assert_eq!(deserialize_embedding(&blob), vec);
    }

    #[test]
    fn registrable_domain_is_suffix_of_host(
        labels in proptest::collection::vec("[a-z][a-z0-9]{0,8}", 1..5)
    ) {
        let host = labels.join(".");
        let url = format!("https://{host}/path");
        let domain = registrable_domain(&url).unwrap();
        // the registrable domain is always a suffix of the host...
        let suffix = format!(".{}", domain);
        prop_assert!(host == domain || host.ends_with(&suffix));
        // ...and idempotent under re-extraction
        prop_assert_eq!(registrable_domain(&domain).unwrap(), domain.clone());
    }

    #[test]
    fn lookalike_prefixes_never_match(victim in "[a-z]{3,10}") {
        // <victim>.com embedded as a subdomain of evil.com must not
        // collapse to <victim>.com
        let lookalike = format!("https://{victim}.com.evil.com/steal");
        prop_assert_eq!(registrable_domain(&lookalike).unwrap(), "evil.com".to_string());
    }
}
