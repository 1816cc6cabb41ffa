//! Transport adapters. Both listeners parse requests and hand them to the
//! [`JobService`](crate::service::JobService); the socket side also
//! delivers results and log lines back to the connection that asked.

pub mod http;
pub mod socket;

pub use socket::{SocketHub, SocketPublisher};
