//! `neomagi-protocol` — wire types for the NeoMagi client/gateway protocol:
//! handshake, request/response/event frames, and method name constants.

pub mod frames;
pub mod handshake;
pub mod methods;

pub use frames::{
    ErrorFrame, ErrorShape, EventFrame, InboundFrame, ReqFrame, ResFrame, StateVersion,
    StreamChunkData, StreamChunkFrame, ToolCallData, ToolCallFrame, ToolDeniedData, ToolDeniedFrame,
};
pub use handshake::{AuthPayload, ClientInfo, ConnectChallenge, ConnectParams, HelloOk, ServerInfo};
