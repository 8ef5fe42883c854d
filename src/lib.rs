// Public modules
pub mod assembler;
pub mod client;
pub mod error;
pub mod observability;
pub mod session;
pub mod sse;
pub mod types;

// Re-exports
pub use assembler::{MessageAssembler, TurnSignal};
pub use client::{ChatClient, Connect, CredentialProvider, EventStream, StaticToken};
pub use error::{Error, Result};
pub use session::{ChatSession, RetryPolicy, SessionEvent};
pub use types::*;
