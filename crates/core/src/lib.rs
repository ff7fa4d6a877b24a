pub mod chat_session;
pub mod conversation_store;
pub mod generation_client;
pub mod limits;
pub mod message;
pub mod message_view;
pub mod persistence;
pub mod results_table;
pub mod settings;
pub mod text2sql;
