//! Wire protocol shared by both agents
//!
//! Frames (`frame`) carry one envelope (`envelope`) each; envelopes carry
//! headers in the typed form defined in `headers`.

pub mod envelope;
pub mod frame;
pub mod headers;

pub use envelope::{
    ConnectRequest, ConnectResult, Envelope, HttpVersion, ProxyAuthentication, Request, Response,
};
pub use headers::Headers;
