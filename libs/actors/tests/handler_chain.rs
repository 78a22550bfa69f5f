//! Property tests for handler chain reordering
//!
//! Whatever sequence of `set_next_handler` calls is applied, the chain stays a
//! single closed ring led by the looper's own handler.

use messaging_actors::{DefaultHandler, HandlerRef, Looper};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_splices_keep_chain_closed(
        extra in 1usize..6,
        splices in prop::collection::vec((0usize..8, 0usize..8), 0..12),
    ) {
        let looper = Looper::new("prop-chain");
        let handlers: Vec<HandlerRef> = (0..extra)
            .map(|i| HandlerRef::new(format!("h{}", i), DefaultHandler))
            .collect();
        for handler in &handlers {
            looper.add_handler(handler).unwrap();
        }
        let total = looper.count_handlers();

        for (from, to) in splices {
            let from = looper.handler_at(from % total).unwrap();
            let to = looper.handler_at(to % total).unwrap();
            let splice = from.set_next_handler(&to);
            if from == to {
                prop_assert!(splice.is_none());
            } else {
                prop_assert!(splice.is_some());
                prop_assert_eq!(from.next_handler().unwrap(), to);
            }
        }

        prop_assert_eq!(looper.count_handlers(), total);
        prop_assert_eq!(looper.handler_at(0).unwrap(), looper.root_handler());

        // Walking `total` steps from any member visits every handler once
        let start = looper.root_handler();
        let mut seen = vec![start.clone()];
        let mut current = start.clone();
        for _ in 1..total {
            current = current.next_handler().unwrap();
            prop_assert!(!seen.contains(&current));
            seen.push(current.clone());
        }
        prop_assert_eq!(current.next_handler().unwrap(), start);

        for handler in &handlers {
            looper.remove_handler(handler);
        }
        looper.quit();
    }
}
