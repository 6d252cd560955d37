//! Book, chapter and reading-progress records, and where they live.

pub mod book;
pub mod chapter;
pub mod progress;

pub use book::{Book, StorageTarget};
pub use chapter::Chapter;
pub use progress::{ReadingProgress, Timestamp};

/// Collection holding book records.
pub const BOOKS: &str = "books";

/// Collection holding the chapters of one book.
pub fn chapters_path(book_id: &str) -> String {
    format!("{}/{}/chapters", BOOKS, book_id)
}

/// Collection holding a signed-in reader's progress records.
pub fn remote_history_path(user_id: &str) -> String {
    format!("users/{}/history", user_id)
}

/// Collection holding one device's progress records.
pub fn device_history_path(device_id: &str) -> String {
    format!("devices/{}/history", device_id)
}
