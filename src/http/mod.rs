//! Wire-format types and incremental parsing for the inbound and outbound
//! HTTP/1.1 legs of a connection.

pub mod message;
pub mod parser;
