/// SQL DDL for the basket database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS baskets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    basket_id INTEGER NOT NULL REFERENCES baskets(id),
    title TEXT NOT NULL,
    title_key TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    touched_at INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (basket_id, title_key)
);

CREATE INDEX IF NOT EXISTS idx_items_basket_order ON items(basket_id, completed, touched_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_items_touched ON items(touched_at);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
