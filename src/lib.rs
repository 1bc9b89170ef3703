//! A calculator service exercising the four call shapes: unary, server
//! streaming, client streaming and bidirectional streaming, plus
//! deadline-bounded calls.
//!
//! Calls run in-process through [`LocalConnector`] or across QUIC through
//! [`RpcClient`] and [`RpcServer`]; either way [`CalculatorClient`] is the
//! caller-facing entry point.

pub mod channel;
pub mod client;
pub mod config;
pub mod deadline;
pub mod engine;
pub mod errors;
pub mod messages;
pub mod service;
pub mod status;
pub mod transport;

pub use channel::{
    CallContext, CallOutcome, ClientCall, Direction, FlowState, RequestSender, RequestStream,
    ResponseReceiver, ResponseSink, ServerCall,
};
pub use client::{CalculatorClient, Connector, LocalConnector};
pub use config::{runtime, CalculatorConfig, RpcConfig};
pub use deadline::Deadline;
pub use engine::Calculator;
pub use errors::RpcError;
pub use messages::*;
pub use service::{CalculatorService, Method};
pub use status::{Code, Status};
pub use transport::{RpcClient, RpcServer};
