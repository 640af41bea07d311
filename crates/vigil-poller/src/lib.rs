// On-premise polling agent
//
// Sits next to the hospital's electronic records database, tails the
// death-record table through a declarative field mapping, normalizes
// rows into canonical events (masking identifiers before anything
// leaves the building) and pushes them to the central ingestion
// endpoint. A watermark file makes restarts resume where they left off.

pub mod config;
pub mod connector;
pub mod normalize;
pub mod poller;
pub mod push;
pub mod state;

pub use config::AgentConfig;
pub use connector::{ConnectorError, SourceConnector, SourceRecord};
pub use poller::{Poller, PollerStatus};
pub use push::HttpSink;
pub use state::{AgentState, StateFile};
