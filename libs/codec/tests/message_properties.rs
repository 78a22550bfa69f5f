//! Property tests for the message data model and wire format
//!
//! - Flatten/unflatten reproduces every name, type and value in order
//! - Add/Remove bookkeeping: counts and index shifting within a type group

use codec::{Message, MessagingError, Point, TypeCode};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Item {
    Int(i32),
    Long(i64),
    Text(String),
    Flag(bool),
    Where(f32, f32),
    Bytes(Vec<u8>),
}

fn item() -> impl Strategy<Value = Item> {
    prop_oneof![
        any::<i32>().prop_map(Item::Int),
        any::<i64>().prop_map(Item::Long),
        "[a-z ]{0,12}".prop_map(Item::Text),
        any::<bool>().prop_map(Item::Flag),
        (-1000.0f32..1000.0, -1000.0f32..1000.0).prop_map(|(x, y)| Item::Where(x, y)),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Item::Bytes),
    ]
}

fn build(what: u32, items: &[(String, Item)]) -> Message {
    let mut msg = Message::new(what);
    for (name, item) in items {
        match item {
            Item::Int(v) => msg.add(name, *v),
            Item::Long(v) => msg.add(name, *v),
            Item::Text(v) => msg.add_str(name, v),
            Item::Flag(v) => msg.add(name, *v),
            Item::Where(x, y) => msg.add(name, Point::new(*x, *y)),
            Item::Bytes(v) => msg.add(name, v.clone()),
        }
        .unwrap();
    }
    msg
}

proptest! {
    #[test]
    fn flatten_round_trip_preserves_fields(
        what in any::<u32>(),
        items in prop::collection::vec(("[a-d]{1,2}", item()), 0..24),
    ) {
        let original = build(what, &items);
        let bytes = original.flatten();
        prop_assert_eq!(bytes.len(), original.flattened_size());

        let decoded = Message::from_flattened(&bytes).unwrap();
        prop_assert_eq!(&decoded, &original);

        let before: Vec<_> = original.fields().map(|f| (f.name.to_string(), f.type_code, f.count)).collect();
        let after: Vec<_> = decoded.fields().map(|f| (f.name.to_string(), f.type_code, f.count)).collect();
        prop_assert_eq!(before, after);
    }

    #[test]
    fn remove_shifts_later_indices(
        values in prop::collection::vec(any::<i32>(), 1..20),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut msg = Message::new(1);
        for v in &values {
            msg.add("v", *v).unwrap();
        }
        let removed = pick.index(values.len());
        msg.remove::<i32>("v", removed).unwrap();

        prop_assert_eq!(msg.count_items("v", TypeCode::INT32), values.len() - 1);
        for index in removed..values.len() - 1 {
            prop_assert_eq!(msg.find::<i32>("v", index).unwrap(), values[index + 1]);
        }
        for index in 0..removed {
            prop_assert_eq!(msg.find::<i32>("v", index).unwrap(), values[index]);
        }
    }

    #[test]
    fn count_tracks_adds_minus_removes(ops in prop::collection::vec(any::<bool>(), 0..40)) {
        let mut msg = Message::new(1);
        let mut expected = 0usize;
        for add in ops {
            if add {
                msg.add("n", expected as i64).unwrap();
                expected += 1;
            } else if expected > 0 {
                msg.remove::<i64>("n", 0).unwrap();
                expected -= 1;
            } else {
                let is_not_found = matches!(msg.remove::<i64>("n", 0), Err(MessagingError::NotFound { .. }));
                prop_assert!(is_not_found);
            }
            prop_assert_eq!(msg.count_items("n", TypeCode::INT64), expected);
        }
    }
}

#[test]
fn test_type_groups_under_one_name_are_independent() {
    let mut msg = Message::new(1);
    msg.add("mixed", 1i32).unwrap();
    msg.add_str("mixed", "a").unwrap();
    msg.add("mixed", 2i32).unwrap();

    msg.remove::<i32>("mixed", 0).unwrap();
    assert_eq!(msg.find::<i32>("mixed", 0).unwrap(), 2);
    assert_eq!(msg.find::<String>("mixed", 0).unwrap(), "a");
    assert_eq!(msg.count_names(TypeCode::ANY), 1);
}

#[test]
fn test_not_found_error_names_the_field() {
    let msg = Message::new(1);
    let err = msg.find::<i32>("missing", 3).unwrap_err();
    assert_eq!(err.to_string(), "Field 'missing' ('LONG') has no item at index 3");
}
