pub mod baskets;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;

pub use baskets::{ItemChange, Store, MAX_TITLE_CHARS};
pub use database::Database;
pub use error::StoreError;
