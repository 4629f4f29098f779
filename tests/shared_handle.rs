mod common;

use std::sync::Arc;

use common::{registry, Profile, User};
use rust_sqlite_records::{Database, DatabaseConfig, Error, Record, Store};

// The shared handle is process-wide, so everything touching it lives in one
// test of its own binary.
#[test]
fn test_shared_database_lifecycle() {
    assert!(matches!(Database::shared(), Err(Error::NotConfigured)));
    assert!(matches!(Store::open_shared(registry()), Err(Error::NotConfigured)));

    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig::new(dir.path().join("shared.db"))
        .with_content_dir(dir.path().join("files"));
    let configured = Database::configure(config.clone()).unwrap();
    assert!(Arc::ptr_eq(&configured, &Database::shared().unwrap()));
    assert!(matches!(Database::configure(config), Err(Error::AlreadyConfigured)));

    let store = Store::open_shared(registry()).unwrap();
    assert!(Arc::ptr_eq(store.database(), &configured));
    let mut user = User::new("Shared", 22);
    user.save(&store).unwrap();

    // a second store over the same handle sees the same rows
    let other = Store::open_shared(registry()).unwrap();
    assert_eq!(User::all(&other).unwrap(), vec![user]);

    let users_dir = User::content_path(&store).unwrap();
    assert_eq!(users_dir, dir.path().join("files").join("users"));
    assert!(users_dir.is_dir());
    let profile_dir = Profile::content_path(&store).unwrap();
    assert_eq!(profile_dir, dir.path().join("files").join("profile"));
}
