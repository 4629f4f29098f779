mod common;

use std::sync::{Arc, Mutex};

use common::{create_test_store, Order, User};
use rust_sqlite_records::{sql_args, Events, ObserverContext, Record, Store};

type Log = Arc<Mutex<Vec<(String, Events)>>>;

fn record_users(store: &Store, events: Events, context: &ObserverContext) -> Log {
    let log: Log = Arc::default();
    let sink = Arc::clone(&log);
    store.add_observer::<User, _>(events, context, move |user, event| {
        sink.lock().unwrap().push((user.name.clone(), event));
        Ok(())
    });
    log
}

fn snapshot(log: &Log) -> Vec<(String, Events)> {
    log.lock().unwrap().clone()
}

#[test]
fn test_insertion_fires_once_per_new_entity() {
    let store = create_test_store();
    let context = ObserverContext::new();
    let log = record_users(&store, Events::INSERTION, &context);

    let mut alice = User::new("Alice", 30);
    alice.save(&store).unwrap();
    assert_eq!(snapshot(&log), vec![("Alice".to_string(), Events::INSERTION)]);

    // an update is not an insertion
    alice.age = 31;
    alice.save(&store).unwrap();
    assert_eq!(snapshot(&log).len(), 1);
}

#[test]
fn test_failed_save_does_not_notify() {
    let store = create_test_store();
    let context = ObserverContext::new();
    let log = record_users(&store, Events::ALL, &context);

    store.database().execute_batch("DROP TABLE users").unwrap();
    assert!(User::new("Lost", 1).save(&store).is_err());
    assert!(snapshot(&log).is_empty());
}

#[test]
fn test_masks_select_events() {
    let store = create_test_store();
    let context = ObserverContext::new();
    let changes = record_users(&store, Events::MODIFICATION | Events::DELETION, &context);
    let everything = record_users(&store, Events::ALL, &context);

    let mut bob = User::new("Bob", 20);
    bob.save(&store).unwrap();
    bob.age = 21;
    bob.save(&store).unwrap();
    bob.delete(&store).unwrap();

    assert_eq!(
        snapshot(&changes),
        vec![
            ("Bob".to_string(), Events::MODIFICATION),
            ("Bob".to_string(), Events::DELETION),
        ]
    );
    let seen: Vec<Events> = snapshot(&everything).into_iter().map(|(_, e)| e).collect();
    assert_eq!(seen, [Events::INSERTION, Events::MODIFICATION, Events::DELETION]);
}

#[test]
fn test_observers_are_scoped_to_their_entity_type() {
    let store = create_test_store();
    let context = ObserverContext::new();
    let log = record_users(&store, Events::ALL, &context);

    let mut order = Order {
        id: None,
        user_id: "nobody".to_string(),
        total: 5.0,
    };
    order.save(&store).unwrap();
    assert!(snapshot(&log).is_empty());
}

#[test]
fn test_bulk_delete_does_not_notify() {
    let store = create_test_store();
    let context = ObserverContext::new();
    User::new("Kid", 9).save(&store).unwrap();
    let log = record_users(&store, Events::DELETION, &context);

    User::delete_all_where(&store, "age < ?", &sql_args![18]).unwrap();
    assert!(User::all(&store).unwrap().is_empty());
    assert!(snapshot(&log).is_empty());
}

#[test]
fn test_remove_observer_stops_delivery() {
    let store = create_test_store();
    let first = ObserverContext::new();
    let second = ObserverContext::new();
    let removed_log = record_users(&store, Events::INSERTION, &first);
    record_users(&store, Events::DELETION, &first);
    let kept_log = record_users(&store, Events::INSERTION, &second);
    assert_eq!(store.observers().len(), 3);

    assert_eq!(store.remove_observer(first), 2);
    assert_eq!(store.observers().len(), 1);

    User::new("Cid", 25).save(&store).unwrap();
    assert!(snapshot(&removed_log).is_empty());
    assert_eq!(snapshot(&kept_log).len(), 1);

    assert_eq!(store.remove_observer(second), 1);
    assert!(store.observers().is_empty());
}

#[test]
fn test_failing_observers_are_isolated() {
    let store = create_test_store();
    let context = ObserverContext::new();
    store.add_observer::<User, _>(Events::ALL, &context, |_, _| {
        Err(anyhow::anyhow!("observer refused"))
    });
    store.add_observer::<User, _>(Events::ALL, &context, |user, _| {
        panic!("observer for {} blew up", user.name)
    });
    let log = record_users(&store, Events::ALL, &context);

    let mut dee = User::new("Dee", 18);
    dee.save(&store).unwrap();
    assert!(User::exists(&store, dee.id.as_deref().unwrap()).unwrap());
    assert_eq!(snapshot(&log), vec![("Dee".to_string(), Events::INSERTION)]);
}

#[test]
fn test_observer_sees_saved_id() {
    let store = create_test_store();
    let context = ObserverContext::new();
    let ids: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
    let sink = Arc::clone(&ids);
    store.add_observer::<User, _>(Events::INSERTION, &context, move |user, _| {
        sink.lock().unwrap().push(user.id.clone());
        Ok(())
    });

    let mut eve = User::new("Eve", 40);
    eve.save(&store).unwrap();
    assert_eq!(*ids.lock().unwrap(), vec![eve.id.clone()]);
}
