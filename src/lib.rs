// Call setup: key exchange, signaling interpretation and the call state machine
pub mod calls;
pub mod config;

pub use calls::{Call, CallDelegate, CallServices, CallState, CallType, SessionIdentity};
pub use config::{CallConfig, DataSaving, MediaConfig};
