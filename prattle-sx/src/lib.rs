pub mod connection;
pub mod sasl;
pub mod starttls;
pub mod stream;
pub mod uplink;
