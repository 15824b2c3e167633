// dpmlink-api: wire layer for the DPM list protocol (codec, transport, sessions, auth)

pub mod auth;
pub mod codec;
pub mod error;
pub mod message;
pub mod request;
pub mod session;
pub mod status;
pub mod transport;

pub use auth::{CredentialProvider, SignedToken, StaticCredentials, authenticate};
pub use error::Error;
pub use message::{ListMode, Message, Setting, Value, ValueType};
pub use request::{DeviceRequest, EventSpec, Property, Range};
pub use session::{AuthState, ListEntry, ListState, Session};
pub use status::{Facility, Severity, Status};
pub use transport::{BoxedStream, Connect, DEFAULT_PORT, TcpConnector, Transport};
