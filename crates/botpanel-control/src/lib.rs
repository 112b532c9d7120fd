pub mod api;
pub mod credential_store;
pub mod error_payload;
pub mod lifecycle;
pub mod request_meta;
pub mod settings;
pub mod state;
