//! Integration tests for the full repository pipeline.
//!
//! Tests: Repository → Session → DocumentStore
//!
//! Every scenario runs against the in-memory store and a private SQLite
//! database. The Postgres variant needs `DATABASE_URL` and is ignored by
//! default.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    use repokit_core::{
        Cancellation, CancellationToken, ConcurrencyStamp, Entity, HasConcurrencyStamp, Pagination,
        Repository, RepositoryResult,
    };

    use crate::document_store::{DocumentChange, DocumentStore, InMemoryDocumentStore, StoredDocument};
    use crate::provider::{ContextProvider, SessionProvider};
    use crate::repository::{DocumentRepository, StoreRepository};

    repokit_core::uuid_key! {
        struct ProductId;
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Product {
        id: ProductId,
        sku: String,
        price_cents: i64,
        stamp: Option<ConcurrencyStamp>,
    }

    impl HasConcurrencyStamp for Product {
        fn concurrency_stamp(&self) -> Option<&ConcurrencyStamp> {
            self.stamp.as_ref()
        }

        fn set_concurrency_stamp(&mut self, stamp: ConcurrencyStamp) {
            self.stamp = Some(stamp);
        }
    }

    impl Entity<ProductId> for Product {
        const COLLECTION: &'static str = "products";

        fn key(&self) -> &ProductId {
            &self.id
        }

        fn as_stamped(&self) -> Option<&dyn HasConcurrencyStamp> {
            Some(self)
        }

        fn as_stamped_mut(&mut self) -> Option<&mut dyn HasConcurrencyStamp> {
            Some(self)
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        name: String,
        value: i64,
        stamp: Option<ConcurrencyStamp>,
    }

    impl HasConcurrencyStamp for Counter {
        fn concurrency_stamp(&self) -> Option<&ConcurrencyStamp> {
            self.stamp.as_ref()
        }

        fn set_concurrency_stamp(&mut self, stamp: ConcurrencyStamp) {
            self.stamp = Some(stamp);
        }
    }

    impl Entity for Counter {
        const COLLECTION: &'static str = "counters";

        fn key(&self) -> &String {
            &self.name
        }

        fn as_stamped(&self) -> Option<&dyn HasConcurrencyStamp> {
            Some(self)
        }

        fn as_stamped_mut(&mut self) -> Option<&mut dyn HasConcurrencyStamp> {
            Some(self)
        }
    }

    /// Unstamped entity with a composite key.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderLine {
        key: (u32, u16),
        quantity: u32,
    }

    impl Entity<(u32, u16)> for OrderLine {
        const COLLECTION: &'static str = "order_lines";

        fn key(&self) -> &(u32, u16) {
            &self.key
        }
    }

    type Provider = Arc<SessionProvider>;

    fn product(sku: &str, price_cents: i64) -> Product {
        Product {
            id: ProductId::new(),
            sku: sku.to_string(),
            price_cents,
            stamp: Some(ConcurrencyStamp::new("initial")),
        }
    }

    fn counter(name: &str, value: i64) -> Counter {
        Counter {
            name: name.to_string(),
            value,
            stamp: None,
        }
    }

    fn line(order: u32, line_no: u16, quantity: u32) -> OrderLine {
        OrderLine {
            key: (order, line_no),
            quantity,
        }
    }

    /// One fresh store per backend under test.
    async fn stores() -> anyhow::Result<Vec<(&'static str, Arc<dyn DocumentStore>)>> {
        repokit_observability::init_for_tests();

        #[allow(unused_mut)]
        let mut stores: Vec<(&'static str, Arc<dyn DocumentStore>)> =
            vec![("memory", Arc::new(InMemoryDocumentStore::new()) as Arc<dyn DocumentStore>)];

        #[cfg(feature = "sqlite")]
        stores.push((
            "sqlite",
            Arc::new(crate::document_store::SqliteDocumentStore::in_memory().await?)
                as Arc<dyn DocumentStore>,
        ));

        Ok(stores)
    }

    fn provider(store: Arc<dyn DocumentStore>) -> Provider {
        Arc::new(SessionProvider::new(store))
    }

    /// Fires `token` in the middle of `apply`: before handing the change set
    /// to the wrapped store, or after the wrapped store has committed it.
    struct CancelDuringApply {
        inner: Arc<dyn DocumentStore>,
        token: CancellationToken,
        after_commit: bool,
    }

    #[async_trait::async_trait]
    impl DocumentStore for CancelDuringApply {
        async fn load(
            &self,
            collection: &str,
            key: &str,
        ) -> RepositoryResult<Option<StoredDocument>> {
            self.inner.load(collection, key).await
        }

        async fn load_collection(&self, collection: &str) -> RepositoryResult<Vec<StoredDocument>> {
            self.inner.load_collection(collection).await
        }

        async fn apply(
            &self,
            changes: Vec<DocumentChange>,
            cancel: &Cancellation,
        ) -> RepositoryResult<usize> {
            if !self.after_commit {
                self.token.cancel();
                return self.inner.apply(changes, cancel).await;
            }
            let written = self.inner.apply(changes, cancel).await?;
            self.token.cancel();
            // Give a racing cancellation branch the chance to win.
            tokio::task::yield_now().await;
            Ok(written)
        }
    }

    fn cancelling_provider(
        store: Arc<dyn DocumentStore>,
        after_commit: bool,
    ) -> (Provider, Cancellation) {
        let token = CancellationToken::new();
        let wrapped = CancelDuringApply {
            inner: store,
            token: token.clone(),
            after_commit,
        };
        (provider(Arc::new(wrapped)), Cancellation::from_token(token))
    }

    #[tokio::test]
    async fn absent_keys_are_not_found_by_get_and_none_by_find() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store);
            let products: StoreRepository<Provider, Product, ProductId> =
                StoreRepository::new(provider.clone());
            let lines: StoreRepository<Provider, OrderLine, (u32, u16)> =
                StoreRepository::new(provider);
            let none = Cancellation::none();

            let missing = ProductId::new();
            assert!(products.find(&missing, &none).await?.is_none(), "{backend}");
            let err = products.get(&missing, &none).await.unwrap_err();
            assert!(err.is_not_found(), "{backend}: {err:?}");

            assert!(lines.find(&(1, 1), &none).await?.is_none(), "{backend}");
            assert!(lines.get(&(1, 1), &none).await.unwrap_err().is_not_found());
        }
        Ok(())
    }

    #[tokio::test]
    async fn auto_saved_insert_is_readable_in_a_new_unit_of_work() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store);
            let repo: StoreRepository<Provider, Product, ProductId> =
                StoreRepository::new(provider.clone());
            let none = Cancellation::none();

            let inserted = repo.insert(product("SKU-1", 1999), true, &none).await?;

            provider.begin_unit_of_work()?;
            let fetched = repo.get(&inserted.id, &none).await?;
            assert_eq!(fetched, inserted, "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn insert_without_auto_save_is_not_committed() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store.clone());
            let repo: StoreRepository<Provider, OrderLine, (u32, u16)> =
                StoreRepository::new(provider.clone());
            let none = Cancellation::none();

            repo.insert(line(7, 1, 3), false, &none).await?;
            assert!(store.load_collection("order_lines").await?.is_empty(), "{backend}");

            assert_eq!(repo.save_changes(&none).await?, 1, "{backend}");
            provider.begin_unit_of_work()?;
            assert_eq!(repo.get(&(7, 1), &none).await?.quantity, 3, "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn second_update_from_the_same_read_conflicts() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store);
            let repo: StoreRepository<Provider, Product, ProductId> =
                StoreRepository::new(provider.clone());
            let none = Cancellation::none();

            let inserted = repo.insert(product("SKU-2", 500), true, &none).await?;

            provider.begin_unit_of_work()?;
            let read = repo.get(&inserted.id, &none).await?;

            provider.begin_unit_of_work()?;
            let mut first = read.clone();
            first.price_cents = 600;
            let first = repo.update(first, &none).await?;
            assert_ne!(first.stamp, read.stamp, "{backend}");
            repo.save_changes(&none).await?;

            provider.begin_unit_of_work()?;
            let mut second = read.clone();
            second.price_cents = 700;
            repo.update(second, &none).await?;
            let err = repo.save_changes(&none).await.unwrap_err();
            assert!(err.is_conflict(), "{backend}: {err:?}");

            provider.begin_unit_of_work()?;
            let current = repo.get(&inserted.id, &none).await?;
            assert_eq!(current.price_cents, 600, "{backend}");
            assert_eq!(current.stamp, first.stamp, "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn stale_delete_conflicts() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store);
            let repo: StoreRepository<Provider, Product, ProductId> =
                StoreRepository::new(provider.clone());
            let none = Cancellation::none();

            let stale = repo.insert(product("SKU-3", 100), true, &none).await?;

            provider.begin_unit_of_work()?;
            repo.update_and_save(stale.clone(), &none).await?;

            provider.begin_unit_of_work()?;
            repo.delete(&stale, &none).await?;
            let err = repo.save_changes(&none).await.unwrap_err();
            assert!(err.is_conflict(), "{backend}: {err:?}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn delete_where_leaves_no_matches_in_the_query() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store);
            let repo: StoreRepository<Provider, OrderLine, (u32, u16)> =
                StoreRepository::new(provider.clone());
            let none = Cancellation::none();

            for (order, line_no, quantity) in [(1, 1, 5), (1, 2, 0), (2, 1, 0), (2, 2, 9)] {
                repo.insert(line(order, line_no, quantity), false, &none).await?;
            }
            repo.save_changes(&none).await?;

            let empty = |l: &OrderLine| l.quantity == 0;
            assert_eq!(repo.delete_where(&empty, &none).await?, 2, "{backend}");

            // Staged removals are already invisible, before and after commit.
            assert!(!repo.query()?.filter(empty).any(&none).await?, "{backend}");
            repo.save_changes(&none).await?;
            provider.begin_unit_of_work()?;
            assert!(!repo.query()?.filter(empty).any(&none).await?, "{backend}");

            let remaining: Vec<_> = repo
                .query()?
                .order_by(|l: &OrderLine| l.key)
                .to_vec(&none)
                .await?
                .into_iter()
                .map(|l| l.key)
                .collect();
            assert_eq!(remaining, vec![(1, 1), (2, 2)], "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn delete_where_with_no_matches_stages_nothing() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store);
            let repo: DocumentRepository<Provider, Counter> = StoreRepository::new(provider.clone());
            let none = Cancellation::none();

            repo.insert(counter("a", 1), true, &none).await?;
            let removed = repo.delete_where(&|c: &Counter| c.value > 100, &none).await?;

            assert_eq!(removed, 0, "{backend}");
            assert!(!provider.context()?.has_changes()?, "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_insert_leaves_the_collection_unchanged() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store.clone());
            let repo: DocumentRepository<Provider, Counter> = StoreRepository::new(provider.clone());
            let none = Cancellation::none();

            let token = CancellationToken::new();
            token.cancel();
            let cancelled = Cancellation::from_token(token);

            let err = repo.insert(counter("a", 1), true, &cancelled).await.unwrap_err();
            assert!(err.is_cancelled(), "{backend}: {err:?}");

            let expired = Cancellation::none().with_timeout(Duration::ZERO);
            let err = repo.insert(counter("b", 2), false, &expired).await.unwrap_err();
            assert!(err.is_cancelled(), "{backend}: {err:?}");

            assert!(!provider.context()?.has_changes()?, "{backend}");
            assert_eq!(repo.query()?.count(&none).await?, 0, "{backend}");
            assert!(store.load_collection("counters").await?.is_empty(), "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_read_and_commit_fail_without_side_effects() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store.clone());
            let repo: DocumentRepository<Provider, Counter> = StoreRepository::new(provider.clone());
            let none = Cancellation::none();

            repo.insert(counter("a", 1), false, &none).await?;

            let token = CancellationToken::new();
            token.cancel();
            let cancelled = Cancellation::from_token(token);

            assert!(repo.find(&"a".to_string(), &cancelled).await.unwrap_err().is_cancelled());
            assert!(repo.save_changes(&cancelled).await.unwrap_err().is_cancelled());
            assert!(repo.query()?.to_vec(&cancelled).await.unwrap_err().is_cancelled());

            assert!(store.load_collection("counters").await?.is_empty(), "{backend}");
            assert!(provider.context()?.has_changes()?, "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_after_the_commit_lands_keeps_the_insert() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let (provider, cancel) = cancelling_provider(store.clone(), true);
            let repo: DocumentRepository<Provider, Counter> = StoreRepository::new(provider.clone());

            let inserted = repo.insert(counter("a", 1), true, &cancel).await?;
            assert!(cancel.is_cancelled(), "{backend}");
            assert_eq!(inserted.value, 1, "{backend}");

            assert!(!provider.context()?.has_changes()?, "{backend}");
            assert!(store.load("counters", "\"a\"").await?.is_some(), "{backend}");
            assert_eq!(repo.find(&"a".to_string(), &Cancellation::none()).await?, Some(inserted));
        }
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_before_the_commit_writes_nothing() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let (provider, cancel) = cancelling_provider(store.clone(), false);
            let repo: DocumentRepository<Provider, Counter> = StoreRepository::new(provider.clone());

            let err = repo.insert(counter("a", 1), true, &cancel).await.unwrap_err();
            assert!(err.is_cancelled(), "{backend}: {err:?}");

            assert!(!provider.context()?.has_changes()?, "{backend}");
            assert!(store.load_collection("counters").await?.is_empty(), "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn failed_auto_save_insert_keeps_the_staged_delete() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let mine = provider(store.clone());
            let ours: DocumentRepository<Provider, Counter> = StoreRepository::new(mine.clone());
            let theirs: DocumentRepository<Provider, Counter> =
                StoreRepository::new(provider(store.clone()));
            let none = Cancellation::none();
            let key = "x".to_string();

            let x = ours.insert(counter("x", 1), true, &none).await?;
            ours.delete(&x, &none).await?;

            let concurrent = theirs.get(&key, &none).await?;
            theirs.update_and_save(concurrent, &none).await?;

            let err = ours.insert(counter("x", 5), true, &none).await.unwrap_err();
            assert!(err.is_conflict(), "{backend}: {err:?}");

            // Still exactly the delete staged before the failed insert.
            assert_eq!(mine.context()?.pending_changes()?, 1, "{backend}");
            assert!(ours.find(&key, &none).await?.is_none(), "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn query_reflects_commits_from_another_unit_of_work() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let ours: DocumentRepository<Provider, Counter> =
                StoreRepository::new(provider(store.clone()));
            let theirs: DocumentRepository<Provider, Counter> =
                StoreRepository::new(provider(store.clone()));
            let none = Cancellation::none();

            ours.insert(counter("x", 1), true, &none).await?;

            let mut concurrent = theirs.get(&"x".to_string(), &none).await?;
            concurrent.value = 2;
            theirs.update_and_save(concurrent, &none).await?;

            let values: Vec<i64> = ours
                .query()?
                .to_vec(&none)
                .await?
                .into_iter()
                .map(|c| c.value)
                .collect();
            assert_eq!(values, vec![2], "{backend}");

            let removed = ours.delete_where(&|c: &Counter| c.value == 2, &none).await?;
            assert_eq!(removed, 1, "{backend}");
            ours.save_changes(&none).await?;
            assert!(store.load_collection("counters").await?.is_empty(), "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn end_to_end_insert_update_delete() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store);
            let repo: DocumentRepository<Provider, Counter> = StoreRepository::new(provider.clone());
            let none = Cancellation::none();
            let key = "A".to_string();

            repo.insert(counter("A", 1), true, &none).await?;
            provider.begin_unit_of_work()?;

            let a = repo.get(&key, &none).await?;
            assert_eq!(a.value, 1, "{backend}");

            let mut changed = a.clone();
            changed.value = 2;
            repo.update_and_save(changed, &none).await?;
            provider.begin_unit_of_work()?;

            let a2 = repo.get(&key, &none).await?;
            assert_eq!(a2.value, 2, "{backend}");
            assert!(a2.stamp.is_some(), "{backend}");
            assert_ne!(a2.stamp, a.stamp, "{backend}");

            repo.delete(&a2, &none).await?;
            repo.save_changes(&none).await?;
            provider.begin_unit_of_work()?;

            assert!(repo.find(&key, &none).await?.is_none(), "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn query_pages_in_sort_order() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store);
            let repo: DocumentRepository<Provider, Counter> = StoreRepository::new(provider);
            let none = Cancellation::none();

            for (name, value) in [("a", 3), ("b", 1), ("c", 5), ("d", 2), ("e", 4)] {
                repo.insert(counter(name, value), false, &none).await?;
            }
            repo.save_changes(&none).await?;

            let page = repo
                .query()?
                .order_by_desc(|c: &Counter| c.value)
                .page(Pagination::new(Some(2), Some(1)), &none)
                .await?;

            let names: Vec<_> = page.items.iter().map(|c| c.name.as_str()).collect();
            assert_eq!(names, vec!["e", "a"], "{backend}");
            assert_eq!(page.total, 5, "{backend}");
            assert!(page.has_more, "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn query_is_evaluated_at_enumeration_time() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store);
            let repo: DocumentRepository<Provider, Counter> = StoreRepository::new(provider);
            let none = Cancellation::none();

            let positive = repo.query()?.filter(|c: &Counter| c.value > 0);
            assert_eq!(positive.clone().count(&none).await?, 0, "{backend}");

            repo.insert(counter("late", 1), true, &none).await?;
            assert_eq!(positive.count(&none).await?, 1, "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn repositories_share_the_unit_of_work() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store.clone());
            let counters: DocumentRepository<Provider, Counter> =
                StoreRepository::new(provider.clone());
            let lines: StoreRepository<Provider, OrderLine, (u32, u16)> =
                StoreRepository::new(provider.clone());
            let none = Cancellation::none();

            counters.insert(counter("orders", 1), false, &none).await?;
            lines.insert(line(1, 1, 1), false, &none).await?;

            // One commit through either repository writes both.
            assert_eq!(lines.save_changes(&none).await?, 2, "{backend}");
            assert_eq!(store.load_collection("counters").await?.len(), 1, "{backend}");
            assert_eq!(store.load_collection("order_lines").await?.len(), 1, "{backend}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_storage_failure() -> anyhow::Result<()> {
        for (backend, store) in stores().await? {
            let provider = provider(store);
            let repo: DocumentRepository<Provider, Counter> = StoreRepository::new(provider.clone());
            let none = Cancellation::none();

            repo.insert(counter("a", 1), true, &none).await?;
            provider.begin_unit_of_work()?;

            let err = repo.insert(counter("a", 2), true, &none).await.unwrap_err();
            assert!(matches!(err, repokit_core::RepositoryError::Storage(_)), "{backend}: {err:?}");
            assert!(!provider.context()?.has_changes()?, "{backend}");

            assert_eq!(repo.get(&"a".to_string(), &none).await?.value, 1, "{backend}");
        }
        Ok(())
    }

    #[cfg(feature = "postgres")]
    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
    async fn postgres_end_to_end() -> anyhow::Result<()> {
        use anyhow::Context;

        repokit_observability::init_for_tests();
        let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let store = crate::document_store::PostgresDocumentStore::connect(&url, 2).await?;
        let provider = provider(Arc::new(store));
        let repo: StoreRepository<Provider, Product, ProductId> =
            StoreRepository::new(provider.clone());
        let none = Cancellation::none();

        let inserted = repo.insert(product("PG-1", 10), true, &none).await?;
        provider.begin_unit_of_work()?;
        let read = repo.get(&inserted.id, &none).await?;

        provider.begin_unit_of_work()?;
        repo.update_and_save(read.clone(), &none).await?;

        provider.begin_unit_of_work()?;
        repo.update(read, &none).await?;
        assert!(repo.save_changes(&none).await.unwrap_err().is_conflict());

        provider.begin_unit_of_work()?;
        let current = repo.get(&inserted.id, &none).await?;
        repo.delete(&current, &none).await?;
        repo.save_changes(&none).await?;
        Ok(())
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            ..ProptestConfig::default()
        })]

        /// Property: after committing a set of counters, `get` agrees with
        /// `find` for every looked-up key and returns exactly what was inserted.
        #[test]
        fn get_agrees_with_find_after_commit(
            present in prop::collection::btree_map("[a-e]{1,3}", -50i64..50, 0..12),
            lookups in prop::collection::vec("[a-e]{1,3}", 1..8),
        ) {
            let rt = runtime();
            let provider = provider(Arc::new(InMemoryDocumentStore::new()));
            let repo: DocumentRepository<Provider, Counter> = StoreRepository::new(provider.clone());
            let none = Cancellation::none();

            rt.block_on(async {
                for (name, value) in &present {
                    repo.insert(counter(name, *value), false, &none).await.unwrap();
                }
                repo.save_changes(&none).await.unwrap();
            });
            provider.begin_unit_of_work().unwrap();

            for lookup in lookups {
                let found = rt.block_on(repo.find(&lookup, &none)).unwrap();
                let got = rt.block_on(repo.get(&lookup, &none));

                match present.get(&lookup) {
                    Some(value) => {
                        let entity = got.unwrap();
                        prop_assert_eq!(Some(entity.clone()), found);
                        prop_assert_eq!(entity.value, *value);
                    }
                    None => {
                        prop_assert!(found.is_none());
                        prop_assert!(got.unwrap_err().is_not_found());
                    }
                }
            }
        }
    }
}
