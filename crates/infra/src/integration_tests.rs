//! Integration tests for the ledger protocol over the in-memory store.
//!
//! Tests: LedgerEngine → UnitOfWork → store, and HistoryPaginator → store.
//!
//! Verifies:
//! - credits are applied exactly once per idempotency token
//! - concurrent credits to one account sum exactly
//! - failures leave the store untouched
//! - cursor pagination neither skips nor repeats entries under concurrent inserts

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tracing::Level;
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::registry;

    use moneybox_core::{
        AccountId, CreditAmount, EntryId, IdempotencyToken, LedgerError, StoreError,
    };
    use moneybox_ledger::{
        Account, HistoryPaginator, LedgerEngine, LedgerEntry, LedgerStore, NewLedgerEntry,
        UnitOfWork, encode_cursor,
    };

    use crate::ledger_store::InMemoryLedgerStore;

    fn token(raw: &str) -> IdempotencyToken {
        IdempotencyToken::new(raw).unwrap()
    }

    fn amount(value: Decimal) -> CreditAmount {
        CreditAmount::new(value).unwrap()
    }

    fn setup(balance: Decimal) -> (InMemoryLedgerStore, LedgerEngine<InMemoryLedgerStore>, AccountId) {
        let store = InMemoryLedgerStore::new();
        let id = AccountId::new("6d7750a1-c3f2-4765-bf8f-33bc80f3f809").unwrap();
        store.create_account(&id, "Test", balance).unwrap();
        let engine = LedgerEngine::new(store.clone());
        (store, engine, id)
    }

    #[tokio::test]
    async fn credit_then_duplicate_keeps_balance() {
        let (_, engine, id) = setup(dec!(100.10));

        let updated = engine
            .apply_credit(&id, &token("tx_1"), amount(dec!(10)))
            .await
            .unwrap();
        assert_eq!(updated.balance, dec!(110.10));

        let err = engine
            .apply_credit(&id, &token("tx_1"), amount(dec!(10)))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::DuplicateTransaction(token("tx_1")));

        assert_eq!(engine.get_account(&id).await.unwrap().balance, dec!(110.10));
    }

    #[tokio::test]
    async fn credit_appends_one_entry() {
        let (store, engine, id) = setup(dec!(0));

        engine
            .apply_credit(&id, &token("tx_a"), amount(dec!(2.50)))
            .await
            .unwrap();

        let entries = store.all_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].account_id, id);
        assert_eq!(entries[0].amount, dec!(2.50));
        assert_eq!(entries[0].idempotency_token, token("tx_a"));
    }

    #[tokio::test]
    async fn updated_at_moves_forward_on_credit() {
        let (_, engine, id) = setup(dec!(0));
        let before = engine.get_account(&id).await.unwrap();

        let after = engine
            .apply_credit(&id, &token("tx_1"), amount(dec!(1)))
            .await
            .unwrap();

        assert!(after.updated_at >= before.updated_at);
        assert_eq!(after.created_at, before.created_at);
    }

    #[tokio::test]
    async fn unknown_account_is_rejected_without_side_effects() {
        let (store, engine, _) = setup(dec!(5));
        let ghost = AccountId::new("ghost").unwrap();

        let err = engine
            .apply_credit(&ghost, &token("tx_ghost"), amount(dec!(1)))
            .await
            .unwrap_err();

        assert_eq!(err, LedgerError::AccountNotFound(ghost.clone()));
        assert!(store.all_entries().unwrap().is_empty());
        assert!(matches!(
            engine.get_account(&ghost).await,
            Err(LedgerError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn token_used_on_another_account_is_a_duplicate() {
        let (store, engine, first) = setup(dec!(0));
        let second = AccountId::new("second").unwrap();
        store.create_account(&second, "Second", dec!(0)).unwrap();

        engine
            .apply_credit(&first, &token("shared"), amount(dec!(3)))
            .await
            .unwrap();
        let err = engine
            .apply_credit(&second, &token("shared"), amount(dec!(3)))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::DuplicateTransaction(_)));
        assert_eq!(engine.get_account(&second).await.unwrap().balance, dec!(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_credits_to_one_account_sum_exactly() {
        let (store, engine, id) = setup(dec!(100.10));

        let mut handles = Vec::new();
        for i in 1..=50u32 {
            let engine = engine.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .apply_credit(&id, &token(&format!("tx_{i}")), amount(Decimal::from(i)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // 1 + 2 + ... + 50
        let expected = dec!(100.10) + Decimal::from(1275);
        assert_eq!(engine.get_account(&id).await.unwrap().balance, expected);

        let entries = store.all_entries().unwrap();
        let sum: Decimal = entries.iter().map(|e| e.amount).sum();
        assert_eq!(entries.len(), 50);
        assert_eq!(sum, Decimal::from(1275));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_apply_exactly_once() {
        let (store, engine, id) = setup(dec!(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let engine = engine.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .apply_credit(&id, &token("same"), amount(dec!(7)))
                    .await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(LedgerError::DuplicateTransaction(_)) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(engine.get_account(&id).await.unwrap().balance, dec!(7));
        assert_eq!(store.all_entries().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_across_accounts_apply_exactly_once() {
        let store = InMemoryLedgerStore::new();
        let engine = LedgerEngine::new(store.clone());
        let ids: Vec<AccountId> = (0..8)
            .map(|i| {
                let id = AccountId::new(format!("acc-{i}")).unwrap();
                store.create_account(&id, "Racer", dec!(0)).unwrap();
                id
            })
            .collect();

        let mut handles = Vec::new();
        for id in ids.clone() {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .apply_credit(&id, &token("contended"), amount(dec!(1)))
                    .await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(LedgerError::DuplicateTransaction(_)) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(successes, 1);

        let mut total = Decimal::ZERO;
        for id in &ids {
            total += engine.get_account(id).await.unwrap().balance;
        }
        assert_eq!(total, dec!(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn token_held_by_a_rolled_back_credit_is_still_applied() {
        let (store, engine, first) = setup(dec!(0));
        let second = AccountId::new("second").unwrap();
        store.create_account(&second, "Second", dec!(0)).unwrap();

        let mut holder = store.begin().await.unwrap();
        holder.lock_account(&first).await.unwrap().unwrap();
        holder
            .insert_entry(NewLedgerEntry::credit(
                first.clone(),
                amount(dec!(5)),
                token("t"),
                chrono::Utc::now(),
            ))
            .await
            .unwrap();

        let contender = {
            let engine = engine.clone();
            let second = second.clone();
            tokio::spawn(async move {
                engine
                    .apply_credit(&second, &token("t"), amount(dec!(5)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        holder.rollback().await.unwrap();

        let updated = contender.await.unwrap().unwrap();
        assert_eq!(updated.balance, dec!(5));
        assert_eq!(engine.get_account(&first).await.unwrap().balance, dec!(0));
        assert_eq!(store.all_entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn credits_to_other_accounts_do_not_wait_for_a_held_lock() {
        let (store, engine, held) = setup(dec!(0));
        let free = AccountId::new("free").unwrap();
        store.create_account(&free, "Free", dec!(0)).unwrap();

        let mut blocker = store.begin().await.unwrap();
        blocker.lock_account(&held).await.unwrap().unwrap();

        let credited = tokio::time::timeout(
            Duration::from_secs(1),
            engine.apply_credit(&free, &token("tx_free"), amount(dec!(1))),
        )
        .await
        .expect("credit to an unlocked account must not block");
        assert_eq!(credited.unwrap().balance, dec!(1));

        blocker.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn deadline_expiry_is_a_persistence_error_and_rolls_back() {
        let (store, engine, id) = setup(dec!(0));
        let engine = engine.with_deadline(Duration::from_millis(50));

        let mut blocker = store.begin().await.unwrap();
        blocker.lock_account(&id).await.unwrap().unwrap();

        let err = engine
            .apply_credit(&id, &token("tx_late"), amount(dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Persistence(StoreError::Timeout(_))));
        assert!(err.is_retryable());

        blocker.rollback().await.unwrap();

        // Same token is still usable: nothing was applied.
        let updated = engine
            .apply_credit(&id, &token("tx_late"), amount(dec!(1)))
            .await
            .unwrap();
        assert_eq!(updated.balance, dec!(1));
    }

    /// Store whose units of work fail on entry insert with a configurable error.
    #[derive(Clone)]
    struct FailingInsertStore {
        inner: InMemoryLedgerStore,
        error: StoreError,
    }

    struct FailingInsertUnitOfWork {
        inner: Box<dyn UnitOfWork>,
        error: StoreError,
    }

    #[async_trait]
    impl UnitOfWork for FailingInsertUnitOfWork {
        async fn lock_account(&mut self, id: &AccountId) -> Result<Option<Account>, StoreError> {
            self.inner.lock_account(id).await
        }

        async fn find_entry_by_token(
            &mut self,
            token: &IdempotencyToken,
        ) -> Result<Option<LedgerEntry>, StoreError> {
            self.inner.find_entry_by_token(token).await
        }

        async fn increment_balance(
            &mut self,
            id: &AccountId,
            amount: Decimal,
        ) -> Result<(), StoreError> {
            self.inner.increment_balance(id, amount).await
        }

        async fn insert_entry(
            &mut self,
            _entry: NewLedgerEntry,
        ) -> Result<LedgerEntry, StoreError> {
            Err(self.error.clone())
        }

        async fn fetch_account(&mut self, id: &AccountId) -> Result<Option<Account>, StoreError> {
            self.inner.fetch_account(id).await
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
            self.inner.rollback().await
        }
    }

    #[async_trait]
    impl LedgerStore for FailingInsertStore {
        async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
            Ok(Box::new(FailingInsertUnitOfWork {
                inner: self.inner.begin().await?,
                error: self.error.clone(),
            }))
        }

        async fn fetch_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
            self.inner.fetch_account(id).await
        }

        async fn list_entries(
            &self,
            account_id: &AccountId,
            before: Option<EntryId>,
            limit: u32,
        ) -> Result<Vec<LedgerEntry>, StoreError> {
            self.inner.list_entries(account_id, before, limit).await
        }

        async fn count_entries(&self, account_id: &AccountId) -> Result<u64, StoreError> {
            self.inner.count_entries(account_id).await
        }
    }

    #[tokio::test]
    async fn store_failure_mid_protocol_rolls_back_the_balance() {
        let (inner, _, id) = setup(dec!(20));
        let engine = LedgerEngine::new(FailingInsertStore {
            inner: inner.clone(),
            error: StoreError::backend("disk full"),
        });

        let err = engine
            .apply_credit(&id, &token("tx_1"), amount(dec!(5)))
            .await
            .unwrap_err();

        assert_eq!(err, LedgerError::Persistence(StoreError::backend("disk full")));
        assert_eq!(inner.fetch_account(&id).await.unwrap().unwrap().balance, dec!(20));
        assert!(inner.all_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unique_violation_on_insert_is_reported_as_duplicate() {
        let (inner, _, id) = setup(dec!(20));
        let engine = LedgerEngine::new(FailingInsertStore {
            inner: inner.clone(),
            error: StoreError::UniqueViolation("ledger_entries_idempotency_token_key".into()),
        });

        let err = engine
            .apply_credit(&id, &token("tx_1"), amount(dec!(5)))
            .await
            .unwrap_err();

        assert_eq!(err, LedgerError::DuplicateTransaction(token("tx_1")));
        assert_eq!(inner.fetch_account(&id).await.unwrap().unwrap().balance, dec!(20));
    }

    /// Records the level of every event emitted on the current thread.
    #[derive(Clone, Default)]
    struct LevelCapture(Arc<Mutex<Vec<Level>>>);

    impl LevelCapture {
        fn levels(&self) -> Vec<Level> {
            self.0.lock().unwrap().clone()
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for LevelCapture {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            self.0.lock().unwrap().push(*event.metadata().level());
        }
    }

    #[tokio::test]
    async fn expected_rejections_do_not_log_errors() {
        let capture = LevelCapture::default();
        let _guard = tracing::subscriber::set_default(registry().with(capture.clone()));
        let (store, engine, id) = setup(dec!(0));

        engine
            .apply_credit(&id, &token("tx_1"), amount(dec!(1)))
            .await
            .unwrap();
        let bad_cursor = HistoryPaginator::new(store).list_history(&id, 10, Some("M")).await;
        let duplicate = engine.apply_credit(&id, &token("tx_1"), amount(dec!(1))).await;
        let ghost = AccountId::new("ghost").unwrap();
        let missing = engine.apply_credit(&ghost, &token("tx_2"), amount(dec!(1))).await;
        let missing_read = engine.get_account(&ghost).await;

        assert!(matches!(duplicate, Err(LedgerError::DuplicateTransaction(_))));
        assert!(matches!(missing, Err(LedgerError::AccountNotFound(_))));
        assert!(matches!(missing_read, Err(LedgerError::AccountNotFound(_))));
        assert!(matches!(bad_cursor, Err(LedgerError::InvalidCursor(_))));

        let levels = capture.levels();
        assert!(levels.contains(&Level::WARN));
        assert!(!levels.contains(&Level::ERROR));
    }

    #[tokio::test]
    async fn persistence_failures_log_at_error() {
        let capture = LevelCapture::default();
        let _guard = tracing::subscriber::set_default(registry().with(capture.clone()));
        let (inner, _, id) = setup(dec!(0));
        let engine = LedgerEngine::new(FailingInsertStore {
            inner,
            error: StoreError::backend("disk full"),
        });

        let err = engine
            .apply_credit(&id, &token("tx_1"), amount(dec!(1)))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Persistence(_)));
        assert!(capture.levels().contains(&Level::ERROR));
    }

    #[tokio::test]
    async fn works_through_a_shared_trait_object() {
        let inner = InMemoryLedgerStore::new();
        let id = AccountId::new("acc-dyn").unwrap();
        inner.create_account(&id, "Dyn", dec!(1)).unwrap();
        let store: Arc<dyn LedgerStore> = Arc::new(inner);

        let engine = LedgerEngine::new(store.clone());
        let history = HistoryPaginator::new(store);

        engine
            .apply_credit(&id, &token("tx_dyn"), amount(dec!(1)))
            .await
            .unwrap();
        let page = history.list_history(&id, 10, None).await.unwrap();

        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].idempotency_token, token("tx_dyn"));
    }

    async fn credit_n(engine: &LedgerEngine<InMemoryLedgerStore>, id: &AccountId, prefix: &str, n: u32) {
        for i in 0..n {
            engine
                .apply_credit(id, &token(&format!("{prefix}_{i}")), amount(dec!(1)))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn pages_walk_history_without_gaps_or_overlap() {
        let (store, engine, id) = setup(dec!(0));
        credit_n(&engine, &id, "tx", 7).await;
        let history = HistoryPaginator::new(store);

        let first = history.list_history(&id, 3, None).await.unwrap();
        assert_eq!(first.entries.len(), 3);
        assert_eq!(first.total, 7);

        let second = history
            .list_history(&id, 3, Some(&first.next_cursor))
            .await
            .unwrap();
        let third = history
            .list_history(&id, 3, Some(&second.next_cursor))
            .await
            .unwrap();
        let done = history
            .list_history(&id, 3, Some(&third.next_cursor))
            .await
            .unwrap();

        assert_eq!(second.entries.len(), 3);
        assert_eq!(third.entries.len(), 1);
        assert!(done.entries.is_empty());
        assert_eq!(done.next_cursor, encode_cursor(EntryId::NONE));

        let ids: Vec<i64> = [&first, &second, &third]
            .iter()
            .flat_map(|page| page.entries.iter().map(|e| e.id.get()))
            .collect();
        assert_eq!(ids, vec![7, 6, 5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn inserts_between_pages_do_not_shift_boundaries() {
        let (store, engine, id) = setup(dec!(0));
        credit_n(&engine, &id, "old", 4).await;
        let history = HistoryPaginator::new(store);

        let first = history.list_history(&id, 2, None).await.unwrap();
        credit_n(&engine, &id, "new", 3).await;
        let second = history
            .list_history(&id, 2, Some(&first.next_cursor))
            .await
            .unwrap();

        let first_ids: Vec<i64> = first.entries.iter().map(|e| e.id.get()).collect();
        let second_ids: Vec<i64> = second.entries.iter().map(|e| e.id.get()).collect();
        assert_eq!(first_ids, vec![4, 3]);
        assert_eq!(second_ids, vec![2, 1]);
        assert_eq!(second.total, 7);
    }

    #[tokio::test]
    async fn history_is_scoped_to_the_account() {
        let (store, engine, id) = setup(dec!(0));
        let other = AccountId::new("other").unwrap();
        store.create_account(&other, "Other", dec!(0)).unwrap();
        credit_n(&engine, &id, "mine", 2).await;
        credit_n(&engine, &other, "theirs", 3).await;
        let history = HistoryPaginator::new(store);

        let page = history.list_history(&id, 10, None).await.unwrap();

        assert_eq!(page.total, 2);
        assert!(page.entries.iter().all(|e| e.account_id == id));
    }

    #[tokio::test]
    async fn history_of_an_account_without_entries_is_empty() {
        let (store, _, id) = setup(dec!(0));
        let history = HistoryPaginator::new(store);

        let page = history.list_history(&id, 10, None).await.unwrap();

        assert!(page.entries.is_empty());
        assert_eq!(page.total, 0);
        assert_eq!(page.next_cursor, "MA==");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            ..ProptestConfig::default()
        })]

        /// Property: for any set of distinct-token credits applied concurrently,
        /// the final balance equals the initial balance plus their sum.
        #[test]
        fn concurrent_credits_preserve_the_sum(
            cents in prop::collection::vec(1i64..1_000_000i64, 1..16),
            initial_cents in 0i64..1_000_000i64,
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            let initial = Decimal::new(initial_cents, 2);
            let expected = initial + cents.iter().map(|c| Decimal::new(*c, 2)).sum::<Decimal>();

            let final_balance = runtime.block_on(async {
                let (_, engine, id) = setup(initial);
                let mut handles = Vec::new();
                for (i, c) in cents.iter().enumerate() {
                    let engine = engine.clone();
                    let id = id.clone();
                    let value = Decimal::new(*c, 2);
                    handles.push(tokio::spawn(async move {
                        engine.apply_credit(&id, &token(&format!("p_{i}")), amount(value)).await
                    }));
                }
                for handle in handles {
                    handle.await.unwrap().unwrap();
                }
                engine.get_account(&id).await.unwrap().balance
            });

            prop_assert_eq!(final_balance, expected);
        }

        /// Property: walking every page with any page size visits each entry
        /// exactly once, newest first.
        #[test]
        fn paging_visits_every_entry_once(entry_count in 0u32..25, page_size in 1u32..10) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let visited = runtime.block_on(async {
                let (store, engine, id) = setup(dec!(0));
                credit_n(&engine, &id, "walk", entry_count).await;
                let history = HistoryPaginator::new(store);

                let mut visited = Vec::new();
                let mut cursor: Option<String> = None;
                loop {
                    let page = history
                        .list_history(&id, page_size, cursor.as_deref())
                        .await
                        .unwrap();
                    assert_eq!(page.total, u64::from(entry_count));
                    if page.entries.is_empty() {
                        break;
                    }
                    visited.extend(page.entries.iter().map(|e| e.id.get()));
                    cursor = Some(page.next_cursor);
                }
                visited
            });

            let unique: HashSet<i64> = visited.iter().copied().collect();
            prop_assert_eq!(visited.len(), entry_count as usize);
            prop_assert_eq!(unique.len(), visited.len());
            prop_assert!(visited.windows(2).all(|w| w[0] > w[1]));
        }
    }
}
