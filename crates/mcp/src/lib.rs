//! MCP (Model Context Protocol) transport for Zimi: a thin adapter that
//! exposes search, suggest, read, list, random, and resolve as tools an
//! agent can call, over stdio or streamable HTTP. All tool handlers call
//! straight into `zimi_core`/`zimi_http` — no logic is duplicated here.

pub mod http;
pub mod protocol;
pub mod stdio;

pub use http::router;
pub use protocol::dispatch_jsonrpc;
pub use stdio::run_stdio;
