pub mod backend;
pub mod config;
pub mod error;
pub mod memory;
pub mod smtp;

pub use backend::{EmailBackend, EmailMessage, EmailResult};
pub use config::{EmailBackendKind, EmailConfig};
pub use error::EmailError;
pub use memory::MemoryEmailBackend;
pub use smtp::SmtpBackend;
