pub mod codec;
pub mod pdu;
pub mod protocol;
pub mod types;
