//! Graph API 访问层
//!
//! 只负责把请求发出去并把响应原样带回来；
//! 成功/限流/永久失败的判断在上传引擎里完成

pub mod client;
pub mod error;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{GraphClient, GraphRequest, GraphTransport, RequestBody};
pub use error::TransportError;
pub use types::{
    GraphErrorBody, GraphErrorKind, GraphResponse, StartSessionResponse, TransferChunkResponse,
    PERMANENT_ERROR_CODES, RATE_LIMIT_ERROR_CODES,
};
