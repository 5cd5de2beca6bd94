//! Wire types shared between the capstan host, the session worker, relay
//! backends, and attach clients.
//!
//! Every protocol in this workspace is line-delimited JSON: one value per
//! line, newline-terminated, no embedded newlines outside of string escapes.
//! This crate only defines the shapes; the IO loops live in `capstan-core`
//! and `capstan-worker`.

mod attach;
mod rpc;
mod snapshot;
mod tools;
mod worker;

pub use attach::AttachOp;
pub use attach::AttachRequest;
pub use rpc::CallToolParams;
pub use rpc::CallToolResult;
pub use rpc::ContentBlock;
pub use rpc::Implementation;
pub use rpc::InitializeResult;
pub use rpc::JSONRPC_VERSION;
pub use rpc::JsonRpcError;
pub use rpc::JsonRpcErrorDetail;
pub use rpc::JsonRpcMessage;
pub use rpc::JsonRpcNotification;
pub use rpc::JsonRpcRequest;
pub use rpc::JsonRpcResponse;
pub use rpc::ListToolsResult;
pub use rpc::RequestId;
pub use rpc::Tool;
pub use snapshot::CapabilityKind;
pub use snapshot::SNAPSHOT_VERSION;
pub use snapshot::SavedCapability;
pub use snapshot::SavedFunction;
pub use snapshot::SavedVariable;
pub use snapshot::SessionSnapshot;
pub use snapshot::VariableKind;
pub use tools::ToolSpec;
pub use worker::AckResponse;
pub use worker::CapabilityListing;
pub use worker::ExecuteResponse;
pub use worker::FunctionInfo;
pub use worker::ImportReport;
pub use worker::ListCapabilitiesResponse;
pub use worker::PingResponse;
pub use worker::RegisterResponse;
pub use worker::RelayFrame;
pub use worker::RestoreFailure;
pub use worker::StateResponse;
pub use worker::WorkerCommand;
