//! Integration tests for the full movement pipeline.
//!
//! Tests: MovementRequest → MovementService → StockStore (ledger + balance) → reads
//!
//! Verifies:
//! - The balance always equals the signed sum of the ledger
//! - Concurrent issues on one product never overdraw it
//! - Failed transactions leave neither a movement nor a balance change behind
//! - Soft-deleted products keep their balance and history

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use proptest::prelude::*;
    use tokio::sync::Barrier;

    use stockledger_core::{ProductId, UserId};
    use stockledger_inventory::{
        MovementError, MovementKind, MovementRequest, NewProduct, NewUser, ProductFilter,
        RawMovementInput, ledger_sum,
    };

    use crate::catalog::CatalogService;
    use crate::movement_service::MovementService;
    use crate::reconcile::Reconciler;
    use crate::stock_levels::StockLevels;
    use crate::store::{
        BalanceCache, FaultPoint, InMemoryStockStore, LedgerFilter, LedgerStore, MAX_LIMIT,
        ProductCatalog, StockStore,
    };

    const SHORT_WAIT: Duration = Duration::from_millis(50);

    struct Fixture {
        store: Arc<InMemoryStockStore>,
        catalog: CatalogService<InMemoryStockStore>,
        movements: MovementService<InMemoryStockStore>,
        actor: UserId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStockStore::new());
        let catalog = CatalogService::new(Arc::clone(&store));
        let actor = catalog.create_user(NewUser::staff("clerk")).await.unwrap();
        Fixture {
            movements: MovementService::new(Arc::clone(&store)),
            catalog,
            store,
            actor,
        }
    }

    impl Fixture {
        async fn product(&self, name: &str) -> ProductId {
            self.catalog
                .create_product(NewProduct::new(name, "pcs"))
                .await
                .unwrap()
        }

        async fn receive(&self, product_id: ProductId, qty: i64) -> i64 {
            self.movements
                .record(&MovementRequest::receipt(product_id, self.actor, qty).unwrap())
                .await
                .unwrap()
                .new_balance
        }

        async fn issue(&self, product_id: ProductId, qty: i64) -> Result<i64, MovementError> {
            self.movements
                .record(&MovementRequest::issue(product_id, self.actor, qty).unwrap())
                .await
                .map(|r| r.new_balance)
        }

        async fn balance(&self, product_id: ProductId) -> i64 {
            self.store.read(product_id).await.unwrap()
        }

        async fn history(&self, product_id: ProductId) -> Vec<(MovementKind, i64)> {
            self.store
                .query(&LedgerFilter::for_product(product_id))
                .await
                .unwrap()
                .into_iter()
                .map(|m| (m.kind, m.magnitude()))
                .collect()
        }
    }

    #[tokio::test]
    async fn widget_receipt_issue_and_rejected_overdraw() {
        let fx = fixture().await;
        let widget = fx.product("Widget").await;
        assert_eq!(fx.balance(widget).await, 0);

        assert_eq!(fx.receive(widget, 50).await, 50);

        let recorded = fx
            .movements
            .record(
                &MovementRequest::issue(widget, fx.actor, 20)
                    .unwrap()
                    .with_note("order #1"),
            )
            .await
            .unwrap();
        assert_eq!(recorded.new_balance, 30);

        let err = fx.issue(widget, 40).await.unwrap_err();
        assert_eq!(
            err,
            MovementError::InsufficientStock {
                available: 30,
                requested: 40
            }
        );
        assert_eq!(fx.balance(widget).await, 30);

        let ledger = fx
            .store
            .query(&LedgerFilter::default().with_product_text("widget"))
            .await
            .unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!((ledger[0].kind, ledger[0].signed_quantity), (MovementKind::Issue, -20));
        assert_eq!(ledger[0].note.as_deref(), Some("order #1"));
        assert_eq!(ledger[0].id, recorded.movement_id);
        assert_eq!((ledger[1].kind, ledger[1].signed_quantity), (MovementKind::Receipt, 50));
        assert!(ledger[0].created_at >= ledger[1].created_at);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_issues_never_overdraw() {
        for _ in 0..20 {
            let fx = fixture().await;
            let p = fx.product("Sprocket").await;
            fx.receive(p, 10).await;

            let barrier = Arc::new(Barrier::new(2));
            let mut handles = Vec::new();
            for _ in 0..2 {
                let service = fx.movements.clone();
                let barrier = Arc::clone(&barrier);
                let request = MovementRequest::issue(p, fx.actor, 7).unwrap();
                handles.push(tokio::spawn(async move {
                    barrier.wait().await;
                    service.record(&request).await
                }));
            }

            let mut outcomes = Vec::new();
            for handle in handles {
                outcomes.push(handle.await.unwrap());
            }

            let successes: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
            assert_eq!(successes.len(), 1);
            assert_eq!(successes[0].new_balance, 3);
            assert!(outcomes.iter().any(|o| matches!(
                o,
                Err(MovementError::InsufficientStock {
                    available: 3,
                    requested: 7
                })
            )));

            assert_eq!(fx.balance(p).await, 3);
            assert_eq!(fx.history(p).await.len(), 2);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_writers_commit_in_ledger_order_and_match_balance() {
        let fx = fixture().await;
        let p = fx.product("Gear").await;
        fx.receive(p, 25).await;

        let mut handles = Vec::new();
        for i in 0..200_i64 {
            let service = fx.movements.clone();
            let actor = fx.actor;
            handles.push(tokio::spawn(async move {
                let request = if i % 3 == 0 {
                    MovementRequest::receipt(p, actor, 1 + i % 5)
                } else {
                    MovementRequest::issue(p, actor, 1 + i % 4)
                }
                .unwrap();
                service.record(&request).await
            }));
        }
        for handle in handles {
            match handle.await.unwrap() {
                Ok(recorded) => assert!(recorded.new_balance >= 0),
                Err(err) => assert!(matches!(err, MovementError::InsufficientStock { .. })),
            }
        }

        let report = Reconciler::new(Arc::clone(&fx.store)).check(p).await.unwrap();
        assert!(report.is_consistent());
        assert!(report.cached >= 0);

        // Replaying the ledger in commit order never dips below zero.
        let history = fx
            .store
            .query(&LedgerFilter::for_product(p).oldest_first().with_limit(MAX_LIMIT))
            .await
            .unwrap();
        assert_eq!(history.len() as u64, report.movement_count);
        let mut running = 0i64;
        for pair in history.windows(2) {
            assert!(pair[0].id < pair[1].id);
            assert!(pair[0].created_at <= pair[1].created_at);
        }
        for movement in &history {
            running += movement.signed_quantity;
            assert!(running >= 0, "balance went negative at {}", movement.id);
        }
        assert_eq!(running, report.cached);
    }

    #[tokio::test]
    async fn fault_between_append_and_balance_update_persists_nothing() {
        let fx = fixture().await;
        let p = fx.product("Flange").await;
        fx.receive(p, 10).await;

        fx.store.inject_fault(FaultPoint::BeforeBalanceUpdate);
        let err = fx.issue(p, 4).await.unwrap_err();
        assert!(matches!(err, MovementError::Storage(_)));
        assert!(!err.is_validation());

        assert_eq!(fx.balance(p).await, 10);
        assert_eq!(fx.history(p).await, vec![(MovementKind::Receipt, 10)]);

        // The lock was released and the fault was one-shot.
        assert_eq!(fx.issue(p, 4).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn fault_at_commit_persists_nothing() {
        let fx = fixture().await;
        let p = fx.product("Flange").await;

        fx.store.inject_fault(FaultPoint::Commit);
        let err = fx
            .movements
            .record(&MovementRequest::receipt(p, fx.actor, 8).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, MovementError::Storage(_)));

        assert_eq!(fx.balance(p).await, 0);
        assert!(fx.history(p).await.is_empty());
        assert_eq!(fx.receive(p, 8).await, 8);
    }

    #[tokio::test]
    async fn lock_timeout_is_busy_with_no_side_effects() {
        let fx = fixture().await;
        let p = fx.product("Pulley").await;
        fx.receive(p, 5).await;

        let held = fx.store.begin(p, SHORT_WAIT).await.unwrap();
        let impatient = fx.movements.clone().with_lock_wait(SHORT_WAIT);

        let err = impatient
            .record(&MovementRequest::issue(p, fx.actor, 1).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, MovementError::Busy(_)));
        assert!(err.is_retryable());
        assert_eq!(fx.balance(p).await, 5);
        assert_eq!(fx.history(p).await.len(), 1);

        drop(held);
        assert_eq!(fx.issue(p, 1).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn locks_on_one_product_do_not_block_another() {
        let fx = fixture().await;
        let busy = fx.product("Busy").await;
        let free = fx.product("Free").await;

        let _held = fx.store.begin(busy, SHORT_WAIT).await.unwrap();
        let impatient = fx.movements.clone().with_lock_wait(SHORT_WAIT);

        let recorded = impatient
            .record(&MovementRequest::receipt(free, fx.actor, 2).unwrap())
            .await
            .unwrap();
        assert_eq!(recorded.new_balance, 2);
        // Readers are not blocked by the held lock either.
        assert_eq!(fx.balance(busy).await, 0);
    }

    #[tokio::test]
    async fn soft_delete_keeps_balance_and_history() {
        let fx = fixture().await;
        let p = fx.product("Bracket").await;
        fx.receive(p, 12).await;
        fx.issue(p, 2).await.unwrap();
        let before = fx.history(p).await;

        fx.catalog.deactivate_product(p).await.unwrap();

        assert_eq!(fx.balance(p).await, 10);
        assert_eq!(fx.history(p).await, before);
        assert_eq!(
            fx.issue(p, 1).await.unwrap_err(),
            MovementError::ProductInactiveOrMissing
        );
        assert_eq!(
            fx.movements
                .record(&MovementRequest::receipt(p, fx.actor, 1).unwrap())
                .await
                .unwrap_err(),
            MovementError::ProductInactiveOrMissing
        );
        assert!(Reconciler::new(Arc::clone(&fx.store)).check(p).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn deactivation_waits_for_in_flight_movement() {
        let fx = fixture().await;
        let p = fx.product("Hinge").await;

        let mut tx = fx.store.begin(p, SHORT_WAIT).await.unwrap();
        let catalog = fx.catalog.clone();
        let deactivation = tokio::spawn(async move { catalog.deactivate_product(p).await });

        tokio::time::sleep(SHORT_WAIT).await;
        assert!(!deactivation.is_finished());
        assert!(fx.store.get_product(p).await.unwrap().unwrap().active);

        tx.rollback().await.unwrap();
        deactivation.await.unwrap().unwrap();
        assert!(!fx.store.get_product(p).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn raw_input_is_validated_before_touching_the_store() {
        let fx = fixture().await;
        let p = fx.product("Spring").await;

        let raw = |kind: &str, quantity: &str| RawMovementInput {
            product_id: p.to_string(),
            actor_id: fx.actor.to_string(),
            kind: kind.to_string(),
            quantity: quantity.to_string(),
            note: None,
        };

        for (kind, quantity) in [("IN", "0"), ("IN", "-3"), ("OUT", "2.5"), ("IN", "")] {
            let err = fx.movements.record_raw(&raw(kind, quantity)).await.unwrap_err();
            assert!(matches!(err, MovementError::InvalidQuantity(_)), "{kind} {quantity}");
        }
        let err = fx.movements.record_raw(&raw("TRANSFER", "1")).await.unwrap_err();
        assert!(matches!(err, MovementError::InvalidKind(_)));

        let mut bad_product = raw("IN", "1");
        bad_product.product_id = "not-a-uuid".to_string();
        assert_eq!(
            fx.movements.record_raw(&bad_product).await.unwrap_err(),
            MovementError::ProductInactiveOrMissing
        );

        assert_eq!(fx.store.ledger_len(), 0);
        assert_eq!(fx.movements.record_raw(&raw("in", " 3 ")).await.unwrap().new_balance, 3);
    }

    #[tokio::test]
    async fn reconciler_detects_and_repairs_drift() {
        let fx = fixture().await;
        let p = fx.product("Nozzle").await;
        fx.receive(p, 9).await;
        fx.issue(p, 4).await.unwrap();

        // Corrupt the cache behind the ledger's back.
        let mut tx = fx.store.begin(p, SHORT_WAIT).await.unwrap();
        tx.reset_balance(42).await.unwrap();
        tx.commit().await.unwrap();

        let reconciler = Reconciler::new(Arc::clone(&fx.store));
        let report = reconciler.check(p).await.unwrap();
        assert!(!report.is_consistent());
        assert_eq!((report.cached, report.ledger_sum, report.movement_count), (42, 5, 2));
        assert_eq!(report.drift(), -37);

        let before = reconciler.rebuild(p).await.unwrap();
        assert_eq!(before, report);
        assert_eq!(fx.balance(p).await, 5);
        assert!(reconciler.check(p).await.unwrap().is_consistent());

        let all = reconciler.check_all(&ProductFilter::all()).await.unwrap();
        assert!(all.iter().all(|r| r.is_consistent()));
    }

    #[tokio::test]
    async fn fast_and_slow_paths_agree() {
        let fx = fixture().await;
        let a = fx.product("Axle").await;
        let b = fx.product("Bearing").await;
        let c = fx.product("Cog").await;
        fx.receive(a, 7).await;
        fx.receive(b, 3).await;
        fx.issue(b, 3).await.unwrap();

        let levels = StockLevels::new(Arc::clone(&fx.store));
        let ids = [a, b, c];
        let fast = levels.balances(&ids).await.unwrap();
        let slow = levels.ledger_totals(&ids).await.unwrap();
        assert_eq!(fast, slow);
        assert_eq!(fast[&a], 7);
        assert_eq!(fast[&b], 0);
        assert_eq!(slow[&c], 0);
    }

    #[tokio::test]
    async fn ledger_filters_by_kind_text_order_and_limit() {
        let fx = fixture().await;
        let bolt = fx
            .catalog
            .create_product(NewProduct::new("Bolt", "pcs").with_supplier("Acme"))
            .await
            .unwrap();
        let nut = fx.product("Nut").await;
        fx.receive(bolt, 10).await;
        fx.receive(nut, 10).await;
        fx.issue(bolt, 1).await.unwrap();
        fx.issue(bolt, 2).await.unwrap();

        let issues = fx
            .store
            .query(&LedgerFilter::default().with_kind(MovementKind::Issue))
            .await
            .unwrap();
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|m| m.signed_quantity < 0));

        let by_supplier = fx
            .store
            .query(&LedgerFilter::default().with_product_text("ACME"))
            .await
            .unwrap();
        assert_eq!(by_supplier.len(), 3);
        assert!(by_supplier.iter().all(|m| m.product_id == bolt));

        let oldest = fx
            .store
            .query(&LedgerFilter::for_product(bolt).oldest_first().with_limit(2))
            .await
            .unwrap();
        let quantities: Vec<_> = oldest.iter().map(|m| m.signed_quantity).collect();
        assert_eq!(quantities, vec![10, -1]);
        assert!(oldest[0].id < oldest[1].id);

        let window = fx.store.query(&LedgerFilter::recent(1)).await.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].signed_quantity, -2);
    }

    #[tokio::test]
    async fn overview_shows_recent_movements_and_low_stock() {
        let fx = fixture().await;
        let p = fx
            .catalog
            .create_product(NewProduct::new("Fuse", "pcs").with_min_stock(5))
            .await
            .unwrap();
        fx.receive(p, 8).await;
        fx.issue(p, 4).await.unwrap();

        let overview = StockLevels::new(Arc::clone(&fx.store))
            .overview(&ProductFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(overview.levels[0].current_stock, 4);
        assert_eq!(overview.low_stock, vec![p]);
        assert_eq!(overview.recent.len(), 2);
        assert_eq!(overview.recent[0].signed_quantity, -4);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Receive(i64),
        Issue(i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..=40).prop_map(Op::Receive),
            (1i64..=40).prop_map(Op::Issue),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn balance_matches_ledger_for_any_history(ops in prop::collection::vec(op_strategy(), 0..40)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let fx = fixture().await;
                let p = fx.product("Prop").await;
                let mut expected = 0i64;

                for op in &ops {
                    match op {
                        Op::Receive(q) => {
                            expected += q;
                            assert_eq!(fx.receive(p, *q).await, expected);
                        }
                        Op::Issue(q) => match fx.issue(p, *q).await {
                            Ok(balance) => {
                                expected -= q;
                                assert_eq!(balance, expected);
                            }
                            Err(MovementError::InsufficientStock { available, requested }) => {
                                assert_eq!(available, expected);
                                assert_eq!(requested, *q);
                                assert!(expected - q < 0);
                            }
                            Err(other) => panic!("unexpected error: {other}"),
                        },
                    }
                }

                let history = fx
                    .store
                    .query(&LedgerFilter::for_product(p).with_limit(MAX_LIMIT))
                    .await
                    .unwrap();
                assert_eq!(ledger_sum(&history), expected);

                let reconciler = Reconciler::new(Arc::clone(&fx.store));
                let report = reconciler.check(p).await.unwrap();
                assert!(report.is_consistent());
                assert_eq!(report.cached, expected);
                assert_eq!(report.movement_count, history.len() as u64);
                assert!(report.cached >= 0);

                let rebuilt = reconciler.rebuild(p).await.unwrap();
                assert_eq!(rebuilt, report);
                assert_eq!(fx.balance(p).await, expected);
            });
        }
    }

    #[tokio::test]
    async fn movement_on_store_trait_object_uses_same_path() {
        let store: Arc<dyn StockStore> = Arc::new(InMemoryStockStore::new());
        let catalog = CatalogService::new(Arc::clone(&store));
        let p = catalog.create_product(NewProduct::new("Dyn", "pcs")).await.unwrap();
        let actor = catalog.ensure_admin("admin").await.unwrap();

        let service = MovementService::new(Arc::clone(&store));
        let recorded = service
            .record_movement(p, actor, MovementKind::Receipt, 6, Some("  ".to_string()))
            .await
            .unwrap();
        assert_eq!(recorded.new_balance, 6);

        let ledger = store.query(&LedgerFilter::for_product(p)).await.unwrap();
        assert_eq!(ledger[0].note, None);
        assert!(ledger[0].created_at <= Utc::now());
    }
}
