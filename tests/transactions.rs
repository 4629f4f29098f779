mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{create_temp_store, create_test_store, User};
use rust_sqlite_records::{Error, Events, ObserverContext, Record, TxOutcome};

fn count_events(store: &rust_sqlite_records::Store, context: &ObserverContext) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&count);
    store.add_observer::<User, _>(Events::ALL, context, move |_, _| {
        sink.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    count
}

#[test]
fn test_rollback_discards_changes_and_notifications() {
    let store = create_test_store();
    let context = ObserverContext::new();
    let fired = count_events(&store, &context);
    User::new("Kept", 50).save(&store).unwrap();
    fired.store(0, Ordering::SeqCst);

    let outcome = store
        .in_transaction(|store| {
            User::new("Temp", 20).save(store)?;
            User::delete_all_where(store, "1 = 1", &[])?;
            Ok(TxOutcome::Rollback)
        })
        .unwrap();

    assert_eq!(outcome, TxOutcome::Rollback);
    let names: Vec<String> = User::all(&store).unwrap().into_iter().map(|u| u.name).collect();
    assert_eq!(names, ["Kept"]);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(!store.database().is_in_transaction());
}

#[test]
fn test_commit_delivers_notifications_after_commit() {
    let (store, _dir) = create_temp_store();
    let context = ObserverContext::new();
    let fired = count_events(&store, &context);

    store
        .in_transaction(|store| {
            let mut ann = User::new("Ann", 30);
            ann.save(store)?;
            ann.age = 31;
            ann.save(store)?;
            assert_eq!(fired.load(Ordering::SeqCst), 0);
            Ok(TxOutcome::Commit)
        })
        .unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 2);
    let all = User::all(&store).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].age, 31);
}

#[test]
fn test_error_in_body_rolls_back_and_propagates() {
    let store = create_test_store();
    let context = ObserverContext::new();
    let fired = count_events(&store, &context);

    let err = store
        .in_transaction(|store| {
            User::new("Ben", 40).save(store)?;
            User::all_where(store, "broken ((", &[])?;
            Ok(TxOutcome::Commit)
        })
        .unwrap_err();

    assert!(matches!(err, Error::Sqlite(_)));
    assert!(User::all(&store).unwrap().is_empty());
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // the store is usable again afterwards
    User::new("Cid", 25).save(&store).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_transactions_do_not_nest() {
    let store = create_test_store();

    store
        .in_transaction(|store| {
            let nested = store.in_transaction(|_| Ok(TxOutcome::Commit));
            assert!(matches!(nested, Err(Error::NestedTransaction)));

            let raw = store.database().in_transaction(|_| Ok(TxOutcome::Commit));
            assert!(matches!(raw, Err(Error::NestedTransaction)));
            Ok(TxOutcome::Rollback)
        })
        .unwrap();

    // both entry points work once the outer transaction has ended
    let outcome = store.in_transaction(|_| Ok(TxOutcome::Commit)).unwrap();
    assert_eq!(outcome, TxOutcome::Commit);
}

#[test]
fn test_database_transaction_with_raw_statements() {
    let store = create_test_store();
    let db = store.database();
    db.execute_batch("CREATE TABLE ledger (entry TEXT NOT NULL)").unwrap();

    db.in_transaction(|db| {
        db.execute_update("INSERT INTO ledger (entry) VALUES (?1)", &[Some("a".into())])?;
        Ok(TxOutcome::Rollback)
    })
    .unwrap();
    assert!(db.execute_query("SELECT entry FROM ledger", &[]).unwrap().is_empty());

    db.in_transaction(|db| {
        assert!(db.is_in_transaction());
        db.execute_update("INSERT INTO ledger (entry) VALUES (?1)", &[Some("b".into())])?;
        Ok(TxOutcome::Commit)
    })
    .unwrap();
    let rows = db.execute_query("SELECT entry FROM ledger", &[]).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("entry"), Some("b"));
}

#[test]
fn test_panicking_body_rolls_back() {
    let store = create_test_store();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = store.in_transaction(|store| {
            User::new("Ghost", 1).save(store)?;
            panic!("body failed");
        });
    }));
    assert!(result.is_err());
    assert!(!store.database().is_in_transaction());
    assert!(User::all(&store).unwrap().is_empty());

    // notification buffer was cleared, so a new transaction may start
    store.in_transaction(|_| Ok(TxOutcome::Commit)).unwrap();
}
