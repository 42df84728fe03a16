// Federated-byzantine-agreement cast node: an Ed25519 identity, a framed
// JSON transport to named peers, and per-(channel, sender) hash chains of
// signed casts agreed on one consensus slot per cast. The FBA protocol
// engine itself is an external collaborator behind `engine::ProtocolEngine`.

pub mod ballot;
pub mod cast;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod node;
pub mod store;
pub mod transport;
pub mod types;
