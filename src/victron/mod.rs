pub mod crypto;
pub mod frame;
pub mod telemetry;

pub use crypto::decrypt;
pub use frame::{decode_frame, victron_payload};
pub use telemetry::decode_telemetry;
