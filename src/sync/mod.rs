//! The sync engine: cache-first reads, optimistic writes and the mutation
//! flush loop.
//!
//! Every user write lands in the local cache and the mutation log in one
//! transaction, so the UI sees it immediately. [`Repository::flush`] then
//! replays the log against the server, oldest first, one flight at a time:
//!
//! - creates swap their pending ID for the one the server assigns,
//! - updates are checked field by field against the server's current copy
//!   and parked as conflicted when someone else changed the same field,
//! - transient failures leave the mutation queued for the next tick.
//!
//! [`SyncCoordinator`] runs refresh-then-flush cycles on a timer or on
//! demand. Results reach the view layer as [`SyncEvent`]s.

mod batch;
pub mod conflict;
mod coordinator;
mod error;
mod flush;
mod mutate;
mod repository;

pub use conflict::detect;
pub use coordinator::{CycleReport, SyncCoordinator, SyncHandle};
pub use error::SyncError;
pub use flush::{FlushOutcome, FlushReport};
pub use repository::{Fetched, Repository, RepositoryOptions, SyncEvent};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::{Repository, RepositoryOptions};
    use crate::db::{FreshnessPolicy, LocalStore};
    use crate::remote::MemoryRemote;

    pub struct TestContext {
        pub repo: Repository,
        pub remote: Arc<MemoryRemote>,
        options: RepositoryOptions,
        _temp_dir: TempDir, // Keep alive for duration of test
    }

    impl TestContext {
        /// A fresh repository over the same database, as after a restart.
        pub async fn reopen(&self) -> Repository {
            Repository::open(
                self.repo.store().clone(),
                self.remote.clone(),
                self.options.clone(),
            )
            .await
            .unwrap()
        }
    }

    pub async fn setup_repo(remote: MemoryRemote) -> TestContext {
        setup_repo_with(remote, RepositoryOptions::default()).await
    }

    pub async fn setup_repo_with(remote: MemoryRemote, options: RepositoryOptions) -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let store = LocalStore::open(&db_path, FreshnessPolicy::default())
            .await
            .unwrap();
        let remote = Arc::new(remote);
        let repo = Repository::open(store, remote.clone(), options.clone())
            .await
            .unwrap();
        TestContext {
            repo,
            remote,
            options,
            _temp_dir: temp_dir,
        }
    }
}
