use basket_core::{BasketKey, Item, ItemId};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::{debug, instrument};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Longest accepted item title, counted in characters.
pub const MAX_TITLE_CHARS: usize = 255;

/// One entry of a [`Store::apply_changes`] batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemChange {
    /// Upsert by title, then set completion on the result when given.
    Upsert {
        title: String,
        completed: Option<bool>,
    },
    /// Set completion on an existing item of the basket.
    Complete { id: ItemId, completed: bool },
}

/// Multi-tenant ledger of basket items.
///
/// Every operation names the basket it acts on and never touches rows of
/// another basket. Mutations go through [`Database::with_tx`], so the single
/// connection serializes them and each one commits as a unit.
#[derive(Clone)]
pub struct Store {
    db: Database,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Insert `title` into the basket, or touch the item whose title matches
    /// case-insensitively. Creates the basket on first use.
    #[instrument(skip(self))]
    pub fn upsert_item(&self, basket_key: &str, title: &str) -> Result<ItemId, StoreError> {
        let key = BasketKey::parse(basket_key)?;
        self.db.with_tx(|tx| upsert_item_tx(tx, &key, title))
    }

    /// Set the completion flag of an item, touching it. The item must belong
    /// to `basket_key`; a foreign or unknown id is reported as `NotFound`.
    #[instrument(skip(self))]
    pub fn set_completion(
        &self,
        basket_key: &str,
        item_id: ItemId,
        completed: bool,
    ) -> Result<(), StoreError> {
        let key = BasketKey::parse(basket_key)?;
        self.db
            .with_tx(|tx| set_completion_tx(tx, &key, item_id, completed))
    }

    /// Apply a batch of changes in one transaction. Either every change
    /// commits or, on the first failure, none does. Returns the id each
    /// change resolved to, in order.
    #[instrument(skip(self, changes), fields(count = changes.len()))]
    pub fn apply_changes(
        &self,
        basket_key: &str,
        changes: &[ItemChange],
    ) -> Result<Vec<ItemId>, StoreError> {
        let key = BasketKey::parse(basket_key)?;

        self.db.with_tx(|tx| {
            let mut ids = Vec::with_capacity(changes.len());
            for change in changes {
                let id = match change {
                    ItemChange::Upsert { title, completed } => {
                        let id = upsert_item_tx(tx, &key, title)?;
                        if let Some(completed) = completed {
                            set_completion_tx(tx, &key, id, *completed)?;
                        }
                        id
                    }
                    ItemChange::Complete { id, completed } => {
                        set_completion_tx(tx, &key, *id, *completed)?;
                        *id
                    }
                };
                ids.push(id);
            }
            Ok(ids)
        })
    }

    /// All items of the basket: incomplete first, then most recently touched,
    /// then newest id. Unknown baskets read as empty.
    #[instrument(skip(self))]
    pub fn items_for_basket(&self, basket_key: &str) -> Result<Vec<Item>, StoreError> {
        let key = BasketKey::parse(basket_key)?;

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT i.id, i.title, i.completed
                 FROM items i
                 JOIN baskets b ON b.id = i.basket_id
                 WHERE b.key = ?1
                 ORDER BY i.completed ASC, i.touched_at DESC, i.id DESC",
            )?;
            let mut rows = stmt.query([key.as_str()])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(Item {
                    id: ItemId(row_helpers::get(row, 0, "items", "id")?),
                    title: row_helpers::get(row, 1, "items", "title")?,
                    completed: row_helpers::get(row, 2, "items", "completed")?,
                });
            }
            Ok(items)
        })
    }

    /// Create the basket if it does not exist yet. Returns `true` when a new
    /// basket was created.
    #[instrument(skip(self))]
    pub fn ensure_basket(&self, basket_key: &str) -> Result<bool, StoreError> {
        let key = BasketKey::parse(basket_key)?;
        self.db
            .with_tx(|tx| ensure_basket_tx(tx, &key).map(|(_, created)| created))
    }

    pub fn basket_exists(&self, basket_key: &str) -> Result<bool, StoreError> {
        let key = BasketKey::parse(basket_key)?;
        self.db.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM baskets WHERE key = ?1", [key.as_str()], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Release the underlying connection. Idempotent.
    pub fn close(&self) {
        self.db.close();
    }
}

fn upsert_item_tx(tx: &Transaction<'_>, key: &BasketKey, title: &str) -> Result<ItemId, StoreError> {
    let title = validate_title(title)?;
    let title_key = fold_title(title);
    let (basket_id, _) = ensure_basket_tx(tx, key)?;
    let touched_at = next_touch(tx)?;
    let id: i64 = tx.query_row(
        "INSERT INTO items (basket_id, title, title_key, completed, touched_at, created_at)
         VALUES (?1, ?2, ?3, 0, ?4, ?5)
         ON CONFLICT (basket_id, title_key) DO UPDATE SET touched_at = excluded.touched_at
         RETURNING id",
        params![basket_id, title, title_key, touched_at, Utc::now().to_rfc3339()],
        |row| row.get(0),
    )?;
    debug!(item_id = id, touched_at, "item upserted");
    Ok(ItemId(id))
}

fn set_completion_tx(
    tx: &Transaction<'_>,
    key: &BasketKey,
    item_id: ItemId,
    completed: bool,
) -> Result<(), StoreError> {
    let touched_at = next_touch(tx)?;
    let changed = tx.execute(
        "UPDATE items SET completed = ?1, touched_at = ?2
         WHERE id = ?3 AND basket_id = (SELECT id FROM baskets WHERE key = ?4)",
        params![completed, touched_at, item_id.0, key.as_str()],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("item {item_id}")));
    }
    Ok(())
}

/// Just-in-time basket creation. Returns the row id and whether it was new.
fn ensure_basket_tx(tx: &Transaction<'_>, key: &BasketKey) -> Result<(i64, bool), StoreError> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO baskets (key, created_at) VALUES (?1, ?2)",
        params![key.as_str(), Utc::now().to_rfc3339()],
    )?;
    let id: i64 = tx.query_row(
        "SELECT id FROM baskets WHERE key = ?1",
        [key.as_str()],
        |row| row.get(0),
    )?;
    if inserted > 0 {
        debug!(basket_id = id, "basket created");
    }
    Ok((id, inserted > 0))
}

/// Next touch timestamp in microseconds. Strictly greater than every touch
/// already stored, even when the clock has not advanced.
fn next_touch(tx: &Transaction<'_>) -> Result<i64, StoreError> {
    let last: i64 = tx.query_row("SELECT COALESCE(MAX(touched_at), 0) FROM items", [], |row| {
        row.get(0)
    })?;
    Ok(Utc::now().timestamp_micros().max(last + 1))
}

fn validate_title(raw: &str) -> Result<&str, StoreError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(StoreError::InvalidTitle("title must not be empty".into()));
    }
    let len = title.chars().count();
    if len > MAX_TITLE_CHARS {
        return Err(StoreError::InvalidTitle(format!(
            "title has {len} characters, limit is {MAX_TITLE_CHARS}"
        )));
    }
    Ok(title)
}

fn fold_title(title: &str) -> String {
    title.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASKET_A: &str = "3f2504e0-4f89-41d3-9a0c-0305e82c3301";
    const BASKET_B: &str = "9b2f6c1e-7d4a-4e2b-8f3c-5a6d7e8f9a0b";

    fn store() -> Store {
        Store::new(Database::in_memory().unwrap())
    }

    fn titles(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.title.as_str()).collect()
    }

    fn count(store: &Store, table: &str) -> i64 {
        store
            .database()
            .with_conn(|conn| {
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap()
    }

    fn touched_at(store: &Store, id: ItemId) -> i64 {
        store
            .database()
            .with_conn(|conn| {
                conn.query_row("SELECT touched_at FROM items WHERE id = ?1", [id.0], |row| {
                    row.get(0)
                })
                .map_err(StoreError::from)
            })
            .unwrap()
    }

    #[test]
    fn new_items_appear_at_the_top() {
        let s = store();
        s.upsert_item(BASKET_A, "Item 1").unwrap();
        s.upsert_item(BASKET_A, "Item 2").unwrap();

        let items = s.items_for_basket(BASKET_A).unwrap();
        assert_eq!(titles(&items), vec!["Item 2", "Item 1"]);
    }

    #[test]
    fn re_adding_moves_item_to_the_top() {
        let s = store();
        s.upsert_item(BASKET_A, "Item 1").unwrap();
        s.upsert_item(BASKET_A, "Item 2").unwrap();
        s.upsert_item(BASKET_A, "Item 1").unwrap();

        let items = s.items_for_basket(BASKET_A).unwrap();
        assert_eq!(titles(&items), vec!["Item 1", "Item 2"]);
    }

    #[test]
    fn upsert_is_idempotent_and_takes_latest_touch() {
        let s = store();
        let first = s.upsert_item(BASKET_A, "Milk").unwrap();
        let first_touch = touched_at(&s, first);
        let second = s.upsert_item(BASKET_A, "Milk").unwrap();

        assert_eq!(first, second);
        assert!(touched_at(&s, second) > first_touch);
        assert_eq!(s.items_for_basket(BASKET_A).unwrap().len(), 1);
    }

    #[test]
    fn upsert_matches_titles_case_insensitively() {
        let s = store();
        let id = s.upsert_item(BASKET_A, "Milk").unwrap();
        let again = s.upsert_item(BASKET_A, "  mILK ").unwrap();
        assert_eq!(id, again);

        let items = s.items_for_basket(BASKET_A).unwrap();
        assert_eq!(titles(&items), vec!["Milk"]);
    }

    #[test]
    fn upsert_folds_non_ascii_case() {
        let s = store();
        let id = s.upsert_item(BASKET_A, "Äpfel").unwrap();
        assert_eq!(s.upsert_item(BASKET_A, "äpfel").unwrap(), id);
    }

    #[test]
    fn upsert_keeps_completion_flag() {
        let s = store();
        let id = s.upsert_item(BASKET_A, "Milk").unwrap();
        s.set_completion(BASKET_A, id, true).unwrap();
        s.upsert_item(BASKET_A, "Milk").unwrap();

        let items = s.items_for_basket(BASKET_A).unwrap();
        assert!(items[0].completed);
    }

    #[test]
    fn completion_changes_reorder() {
        let s = store();
        let id1 = s.upsert_item(BASKET_A, "Item 1").unwrap();
        s.upsert_item(BASKET_A, "Item 2").unwrap();
        let id3 = s.upsert_item(BASKET_A, "Item 3").unwrap();
        let id4 = s.upsert_item(BASKET_A, "Item 4").unwrap();

        assert_eq!(
            titles(&s.items_for_basket(BASKET_A).unwrap()),
            vec!["Item 4", "Item 3", "Item 2", "Item 1"]
        );

        s.set_completion(BASKET_A, id4, true).unwrap();
        s.set_completion(BASKET_A, id1, false).unwrap();
        assert_eq!(
            titles(&s.items_for_basket(BASKET_A).unwrap()),
            vec!["Item 1", "Item 3", "Item 2", "Item 4"]
        );

        s.set_completion(BASKET_A, id3, true).unwrap();
        assert_eq!(
            titles(&s.items_for_basket(BASKET_A).unwrap()),
            vec!["Item 1", "Item 2", "Item 3", "Item 4"]
        );
    }

    #[test]
    fn touches_are_strictly_increasing() {
        let s = store();
        let mut last = 0;
        for n in 0..50 {
            let id = s.upsert_item(BASKET_A, &format!("Item {n}")).unwrap();
            let t = touched_at(&s, id);
            assert!(t > last, "touch {t} not after {last}");
            last = t;
        }
    }

    #[test]
    fn equal_touch_breaks_ties_by_id() {
        let s = store();
        let a = s.upsert_item(BASKET_A, "A").unwrap();
        let b = s.upsert_item(BASKET_A, "B").unwrap();
        s.database()
            .with_conn(|conn| {
                conn.execute("UPDATE items SET touched_at = 1", [])?;
                Ok(())
            })
            .unwrap();

        let items = s.items_for_basket(BASKET_A).unwrap();
        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![b, a]);
    }

    #[test]
    fn baskets_are_isolated() {
        let s = store();
        s.upsert_item(BASKET_A, "Milk").unwrap();
        s.upsert_item(BASKET_B, "Bread").unwrap();

        assert_eq!(titles(&s.items_for_basket(BASKET_A).unwrap()), vec!["Milk"]);
        assert_eq!(titles(&s.items_for_basket(BASKET_B).unwrap()), vec!["Bread"]);
    }

    #[test]
    fn same_title_in_two_baskets_is_two_items() {
        let s = store();
        let a = s.upsert_item(BASKET_A, "Milk").unwrap();
        let b = s.upsert_item(BASKET_B, "Milk").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn completing_in_own_basket_succeeds() {
        let s = store();
        let id = s.upsert_item(BASKET_A, "Item A").unwrap();
        s.upsert_item(BASKET_B, "Item B").unwrap();

        s.set_completion(BASKET_A, id, true).unwrap();

        let items = s.items_for_basket(BASKET_A).unwrap();
        assert_eq!(titles(&items), vec!["Item A"]);
        assert!(items[0].completed);
        assert!(!s.items_for_basket(BASKET_B).unwrap()[0].completed);
    }

    #[test]
    fn completing_with_foreign_key_is_not_found() {
        let s = store();
        let id = s.upsert_item(BASKET_A, "Item A").unwrap();
        s.upsert_item(BASKET_B, "Item B").unwrap();
        let before = touched_at(&s, id);

        let result = s.set_completion(BASKET_B, id, true);
        assert!(matches!(result, Err(StoreError::NotFound(_))));

        let items = s.items_for_basket(BASKET_A).unwrap();
        assert!(!items[0].completed);
        assert_eq!(touched_at(&s, id), before);
    }

    #[test]
    fn foreign_and_unknown_ids_are_indistinguishable() {
        let s = store();
        let id = s.upsert_item(BASKET_A, "Item A").unwrap();
        s.upsert_item(BASKET_B, "Item B").unwrap();

        let foreign = s.set_completion(BASKET_B, id, true).unwrap_err();
        let unknown = s.set_completion(BASKET_B, ItemId(9_999), true).unwrap_err();
        assert_eq!(foreign.to_string(), format!("not found: item {id}"));
        assert_eq!(unknown.to_string(), "not found: item 9999");
        assert_eq!(foreign.error_kind(), unknown.error_kind());
    }

    #[test]
    fn empty_title_fails_without_writing() {
        let s = store();
        assert!(matches!(s.upsert_item(BASKET_A, ""), Err(StoreError::InvalidTitle(_))));
        assert!(matches!(s.upsert_item(BASKET_A, "   "), Err(StoreError::InvalidTitle(_))));
        assert_eq!(count(&s, "items"), 0);
        assert_eq!(count(&s, "baskets"), 0);
    }

    #[test]
    fn too_long_title_fails_without_writing() {
        let s = store();
        let long = "a".repeat(MAX_TITLE_CHARS + 1);
        assert!(matches!(s.upsert_item(BASKET_A, &long), Err(StoreError::InvalidTitle(_))));
        assert_eq!(count(&s, "items"), 0);
        assert_eq!(count(&s, "baskets"), 0);
    }

    #[test]
    fn title_limit_counts_characters() {
        let s = store();
        let max = "é".repeat(MAX_TITLE_CHARS);
        assert!(s.upsert_item(BASKET_A, &max).is_ok());
    }

    #[test]
    fn invalid_key_fails_without_writing() {
        let s = store();
        let v7 = uuid::Uuid::now_v7().to_string();
        for key in ["sample-basket", "", v7.as_str()] {
            assert!(matches!(s.upsert_item(key, "Milk"), Err(StoreError::InvalidKey(_))));
        }
        assert!(matches!(s.items_for_basket("nope"), Err(StoreError::InvalidKey(_))));
        assert!(matches!(
            s.set_completion("nope", ItemId(1), true),
            Err(StoreError::InvalidKey(_))
        ));
        assert_eq!(count(&s, "items"), 0);
        assert_eq!(count(&s, "baskets"), 0);
    }

    #[test]
    fn batch_applies_in_order() {
        let s = store();
        let ids = s
            .apply_changes(
                BASKET_A,
                &[
                    ItemChange::Upsert {
                        title: "Milk".into(),
                        completed: None,
                    },
                    ItemChange::Upsert {
                        title: "Eggs".into(),
                        completed: Some(true),
                    },
                ],
            )
            .unwrap();
        assert_eq!(ids.len(), 2);

        s.apply_changes(
            BASKET_A,
            &[ItemChange::Complete {
                id: ids[0],
                completed: true,
            }],
        )
        .unwrap();

        let items = s.items_for_basket(BASKET_A).unwrap();
        assert_eq!(titles(&items), vec!["Milk", "Eggs"]);
        assert!(items.iter().all(|i| i.completed));
    }

    #[test]
    fn failing_batch_commits_nothing() {
        let s = store();
        let bread = s.upsert_item(BASKET_A, "Bread").unwrap();
        let before = touched_at(&s, bread);

        let err = s
            .apply_changes(
                BASKET_A,
                &[
                    ItemChange::Upsert {
                        title: "Milk".into(),
                        completed: None,
                    },
                    ItemChange::Complete {
                        id: bread,
                        completed: true,
                    },
                    ItemChange::Upsert {
                        title: "  ".into(),
                        completed: None,
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTitle(_)));

        let items = s.items_for_basket(BASKET_A).unwrap();
        assert_eq!(titles(&items), vec!["Bread"]);
        assert!(!items[0].completed);
        assert_eq!(touched_at(&s, bread), before);
    }

    #[test]
    fn failing_batch_in_new_basket_leaves_no_basket() {
        let s = store();
        let err = s
            .apply_changes(
                BASKET_B,
                &[
                    ItemChange::Upsert {
                        title: "Milk".into(),
                        completed: None,
                    },
                    ItemChange::Complete {
                        id: ItemId(42),
                        completed: true,
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(count(&s, "items"), 0);
        assert_eq!(count(&s, "baskets"), 0);
    }

    #[test]
    fn unknown_basket_reads_empty() {
        let s = store();
        let items = s.items_for_basket(BASKET_A).unwrap();
        assert!(items.is_empty());
        assert!(!s.basket_exists(BASKET_A).unwrap());
    }

    #[test]
    fn keys_are_canonicalized() {
        let s = store();
        s.upsert_item(&BASKET_A.to_uppercase(), "Milk").unwrap();
        assert_eq!(titles(&s.items_for_basket(BASKET_A).unwrap()), vec!["Milk"]);
    }

    #[test]
    fn ensure_basket_reports_creation() {
        let s = store();
        assert!(s.ensure_basket(BASKET_A).unwrap());
        assert!(!s.ensure_basket(BASKET_A).unwrap());
        assert!(s.basket_exists(BASKET_A).unwrap());
        assert_eq!(count(&s, "baskets"), 1);
    }

    #[test]
    fn upsert_creates_basket_once() {
        let s = store();
        s.upsert_item(BASKET_A, "Milk").unwrap();
        s.upsert_item(BASKET_A, "Bread").unwrap();
        assert_eq!(count(&s, "baskets"), 1);
    }

    #[test]
    fn operations_fail_after_close() {
        let s = store();
        s.upsert_item(BASKET_A, "Milk").unwrap();
        s.close();
        s.close();
        assert!(matches!(s.items_for_basket(BASKET_A), Err(StoreError::Closed)));
        assert!(matches!(s.upsert_item(BASKET_A, "Milk"), Err(StoreError::Closed)));
    }

    #[test]
    fn concurrent_writers_serialize() {
        let s = store();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let s = s.clone();
                std::thread::spawn(move || {
                    for n in 0..25 {
                        s.upsert_item(BASKET_A, &format!("t{t}-{n}")).unwrap();
                        s.upsert_item(BASKET_A, "shared").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let items = s.items_for_basket(BASKET_A).unwrap();
        assert_eq!(items.len(), 8 * 25 + 1);
        assert_eq!(items.iter().filter(|i| i.title == "shared").count(), 1);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("basket.db");
        {
            let s = Store::new(Database::open(&path).unwrap());
            let id = s.upsert_item(BASKET_A, "Milk").unwrap();
            s.set_completion(BASKET_A, id, true).unwrap();
            s.close();
        }
        let s = Store::new(Database::open(&path).unwrap());
        let items = s.items_for_basket(BASKET_A).unwrap();
        assert_eq!(titles(&items), vec!["Milk"]);
        assert!(items[0].completed);
    }
}
