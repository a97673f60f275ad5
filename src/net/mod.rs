pub mod connection;
pub mod framing;
pub mod protocol;
pub mod tls;
