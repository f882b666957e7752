use std::sync::{Arc, RwLock};

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

/// Identifies a page in the database file. Non-negative for real pages.
pub type PageId = i32;

/// A page id that refers to no page.
pub const INVALID_PAGE_ID: PageId = -1;

pub type TableId = i64;

pub type TransactionId = i64;
