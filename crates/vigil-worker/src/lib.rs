// Pipeline workers
//
// - motor: bus consumer applying tenant triage rules and opening
//   occurrences (idempotent on (hospital_id, source_event_ref))
// - dispatch: per-channel queue drainers with exponential backoff and
//   dead-lettering
// - transport: the HTTP delivery edge for email, SMS and push

pub mod dispatch;
pub mod motor;
pub mod transport;

pub use dispatch::{ChannelDispatcher, DispatcherConfig, DrainStats};
pub use motor::{MotorConfig, TriageMotor};
pub use transport::{DeliveryError, Transport, TransportConfig};
