pub mod chat_store;

pub use chat_store::{ChatStore, GuildSettingsRow, QuotaRow, StoredEntry};
