//! 分片上传协议（服务端）

pub mod error;
pub mod record;
pub mod service;
pub mod types;

pub use error::ProtocolError;
pub use record::{DomainRecord, FinalizedUpload, LocalRecordCreator, RecordCreator, RecordKind};
pub use service::{ProtocolResult, ProtocolSettings, UploadService};
pub use types::{
    AckResponse, ApiResponse, ChunkPayload, FinalizeResponse, InitUploadRequest, InitUploadResponse,
    SessionStatusResponse, UploadChunkRequest, UploadChunkResponse,
};
