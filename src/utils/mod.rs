pub mod http_client;
pub mod utf8;
