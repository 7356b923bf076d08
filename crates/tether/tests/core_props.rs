use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use proptest::prelude::*;
use tether::core::{CacheControl, ProgressChoke, decode_data_url};
use url::Url;

proptest! {
    #[test]
    fn choke_spaces_middle_updates_by_interval(
        steps in prop::collection::vec(0u64..250, 1..60),
        interval_ms in 1u64..200,
    ) {
        let start = Instant::now();
        let interval = Duration::from_millis(interval_ms);
        let total = steps.len() as u64;
        let mut choke = ProgressChoke::new(interval);
        let mut elapsed = 0;
        let mut last_middle: Option<u64> = None;
        for (i, step) in steps.iter().enumerate() {
            elapsed += step;
            let done = i as u64 + 1;
            let emitted = choke.should_emit(start + Duration::from_millis(elapsed), done, Some(total));
            if i == 0 || done == total {
                prop_assert!(emitted);
            } else if emitted {
                if let Some(previous) = last_middle {
                    prop_assert!(elapsed - previous >= interval_ms);
                }
            }
            if emitted {
                last_middle = Some(elapsed);
            }
        }
    }

    #[test]
    fn base64_data_url_yields_original_bytes(body in prop::collection::vec(any::<u8>(), 0..256)) {
        let url = Url::parse(&format!("data:application/octet-stream;base64,{}", STANDARD.encode(&body))).unwrap();
        let data = decode_data_url(&url).unwrap();
        prop_assert_eq!(data.media_type, "application/octet-stream");
        prop_assert_eq!(&data.body[..], &body[..]);
    }

    #[test]
    fn percent_encoded_data_url_yields_original_text(text in "\\PC{0,64}") {
        let url = Url::parse(&format!("data:,{}", utf8_percent_encode(&text, NON_ALPHANUMERIC))).unwrap();
        let data = decode_data_url(&url).unwrap();
        prop_assert_eq!(&data.body[..], text.as_bytes());
    }

    #[test]
    fn no_store_anywhere_blocks_storage(
        before in prop::collection::vec("[a-z-]{1,12}(=[0-9]{1,4})?", 0..4),
        after in prop::collection::vec("[a-z-]{1,12}(=[0-9]{1,4})?", 0..4),
    ) {
        let mut directives = before.clone();
        directives.push("no-store".to_owned());
        directives.extend(after);
        let control = CacheControl::parse(&directives.join(", "));
        prop_assert!(!control.is_storable());
    }
}
