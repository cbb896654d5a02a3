//! HTTP side of file sharing: multipart upload into a room, download as an
//! attachment, and inline image preview.
//!
//! Uploads are streamed straight to disk and checked against the room's
//! size limit as they arrive. A blob is only referenced by a room once it
//! is complete; every failure path deletes whatever was written.

use std::ffi::OsStr;
use std::fmt::Write as _;
use std::io;
use std::path::Path;
use std::sync::Arc;

use futures_util::{pin_mut, stream, Stream, TryStreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;
use warp::http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use warp::http::StatusCode;
use warp::hyper::Body;
use warp::multipart::{FormData, Part};
use warp::reply::Response;
use warp::{Buf, Filter, Rejection, Reply};

use crate::files::{BlobStore, DiskBlobStore};
use crate::messages::ServerMessage;
use crate::room::{now_millis, FileRecord};
use crate::server::Server;

const FORM_OVERHEAD: u64 = 1024 * 1024;
const MAX_FIELD_LEN: usize = 4096;
const READ_CHUNK: usize = 64 * 1024;
const DEFAULT_MIME: &str = "application/octet-stream";
const UNKNOWN_NAME: &str = "unknown";
const UNKNOWN_SENDER: &str = "unknown";
const ANONYMOUS: &str = "Anonymous";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Malformed upload: {0}")]
    Malformed(String),
    #[error("Room not found")]
    RoomNotFound,
    #[error("File not found")]
    FileNotFound,
    #[error("File too large (limit is {limit} bytes)")]
    TooLarge { limit: u64 },
    #[error("Not an image")]
    NotAnImage,
    #[error("Storage failure: {0}")]
    Storage(#[from] io::Error),
    #[error("Failed to build response: {0}")]
    Response(#[from] warp::http::Error),
}

impl TransferError {
    fn malformed(e: warp::Error) -> Self {
        TransferError::Malformed(e.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            TransferError::MissingField(_) | TransferError::Malformed(_) | TransferError::NotAnImage => {
                StatusCode::BAD_REQUEST
            }
            TransferError::RoomNotFound | TransferError::FileNotFound => StatusCode::NOT_FOUND,
            TransferError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            TransferError::Storage(_) | TransferError::Response(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Reply for TransferError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = warp::reply::json(&json!({ "success": false, "error": self.to_string() }));
        warp::reply::with_status(body, status).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    #[serde(default, alias = "roomId")]
    room_id: String,
}

/// Shared state of the file handlers.
pub struct FileContext {
    server: Arc<Server>,
    blobs: Arc<DiskBlobStore>,
    ceiling: u64,
}

struct StoredBlob {
    room_id: String,
    handle: String,
    name: String,
    mime_type: String,
    size: u64,
}

#[derive(Default)]
struct PendingUpload {
    room_id: Option<String>,
    sender_id: Option<String>,
    sender_name: Option<String>,
    blob: Option<StoredBlob>,
}

impl FileContext {
    /// `ceiling` caps every upload regardless of the room's own limit.
    pub fn new(server: Arc<Server>, blobs: Arc<DiskBlobStore>, ceiling: u64) -> Self {
        FileContext { server, blobs, ceiling }
    }

    async fn receive(&self, form: FormData) -> Result<FileRecord, TransferError> {
        let mut pending = PendingUpload::default();
        if let Err(e) = self.read_form(form, &mut pending).await {
            if let Some(blob) = pending.blob {
                self.discard(&blob.handle).await;
            }
            return Err(e);
        }
        let blob = pending.blob.ok_or(TransferError::MissingField("file"))?;

        let record = FileRecord {
            id: Uuid::new_v4().to_string(),
            name: blob.name,
            size: blob.size,
            mime_type: blob.mime_type,
            sender_id: pending
                .sender_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| UNKNOWN_SENDER.to_owned()),
            sender_name: pending
                .sender_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| ANONYMOUS.to_owned()),
            storage: blob.handle,
            created_at: now_millis(),
        };

        let hub = self.server.hub();
        match self.server.registry().add_file(&blob.room_id, record.clone()).await {
            Ok(room) => {
                info!(
                    "{} uploaded {} ({} bytes) to room {}",
                    record.sender_name, record.name, record.size, room.id
                );
                hub.publish(
                    &room.id,
                    ServerMessage::FileUploaded {
                        room_id: room.id.clone(),
                        file: record.clone(),
                    },
                )
                .await;
                hub.publish(&room.id.clone(), ServerMessage::RoomUpdated { room })
                    .await;
                Ok(record)
            }
            // The room closed while the bytes were in flight.
            Err(_) => {
                self.discard(&record.storage).await;
                Err(TransferError::RoomNotFound)
            }
        }
    }

    async fn read_form(&self, form: FormData, pending: &mut PendingUpload) -> Result<(), TransferError> {
        pin_mut!(form);
        while let Some(part) = form.try_next().await.map_err(TransferError::malformed)? {
            let name = part.name().to_owned();
            match name.as_str() {
                "room_id" | "roomId" => pending.room_id = Some(read_field(part).await?),
                "sender_id" | "senderId" => pending.sender_id = Some(read_field(part).await?),
                "sender_name" | "senderName" => pending.sender_name = Some(read_field(part).await?),
                "file" if pending.blob.is_none() => {
                    let room_id = pending
                        .room_id
                        .as_deref()
                        .filter(|id| !id.is_empty())
                        .ok_or(TransferError::MissingField("room_id"))?;
                    let room = self
                        .server
                        .registry()
                        .get_room(room_id)
                        .await
                        .ok_or(TransferError::RoomNotFound)?;
                    let limit = room.settings.max_file_size.min(self.ceiling);
                    pending.blob = Some(self.store(part, room.id, limit).await?);
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn store(&self, part: Part, room_id: String, limit: u64) -> Result<StoredBlob, TransferError> {
        let name = part
            .filename()
            .map(base_name)
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_NAME)
            .to_owned();
        let mime_type = part
            .content_type()
            .filter(|mime| is_header_safe(mime))
            .unwrap_or(DEFAULT_MIME)
            .to_owned();
        let extension = Path::new(&name).extension().and_then(OsStr::to_str);

        let (handle, mut file) = self.blobs.create(extension).await?;
        match write_blob(part.stream(), &mut file, limit).await {
            Ok(size) => Ok(StoredBlob {
                room_id,
                handle,
                name,
                mime_type,
                size,
            }),
            Err(e) => {
                drop(file);
                self.discard(&handle).await;
                Err(e)
            }
        }
    }

    async fn serve(&self, file_id: &str, query: &FileQuery, inline: bool) -> Result<Response, TransferError> {
        let registry = self.server.registry();
        if registry.get_room(&query.room_id).await.is_none() {
            return Err(TransferError::RoomNotFound);
        }
        let record = registry
            .find_file(&query.room_id, file_id)
            .await
            .ok_or(TransferError::FileNotFound)?;
        if inline && !record.mime_type.starts_with("image/") {
            return Err(TransferError::NotAnImage);
        }
        let file = self.blobs.open(&record.storage).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                TransferError::FileNotFound
            } else {
                TransferError::Storage(e)
            }
        })?;

        let builder = warp::http::Response::builder()
            .header(CONTENT_TYPE, record.mime_type.as_str())
            .header(CONTENT_LENGTH, record.size);
        let builder = if inline {
            builder.header(CACHE_CONTROL, "public, max-age=3600")
        } else {
            builder.header(CONTENT_DISPOSITION, attachment(&record.name))
        };
        Ok(builder.body(Body::wrap_stream(stream::try_unfold(file, next_chunk)))?)
    }

    async fn discard(&self, handle: &str) {
        if let Err(e) = self.blobs.delete(handle).await {
            error!("Failed to delete partial blob {}: {}", handle, e);
        }
    }
}

pub fn file_routes(ctx: Arc<FileContext>) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let form_limit = ctx.ceiling.saturating_add(FORM_OVERHEAD);
    let with_ctx = warp::any().map(move || Arc::clone(&ctx));

    let upload = warp::path!("api" / "upload")
        .and(warp::post())
        .and(warp::multipart::form().max_length(form_limit))
        .and(with_ctx.clone())
        .and_then(upload);
    let download = warp::path!("api" / "download" / String)
        .and(warp::get())
        .and(warp::query::<FileQuery>())
        .and(with_ctx.clone())
        .and_then(|file_id: String, query: FileQuery, ctx: Arc<FileContext>| serve(file_id, query, ctx, false));
    let preview = warp::path!("api" / "preview" / String)
        .and(warp::get())
        .and(warp::query::<FileQuery>())
        .and(with_ctx)
        .and_then(|file_id: String, query: FileQuery, ctx: Arc<FileContext>| serve(file_id, query, ctx, true));

    upload.or(download).unify().or(preview).unify()
}

async fn upload(form: FormData, ctx: Arc<FileContext>) -> Result<Response, Rejection> {
    Ok(match ctx.receive(form).await {
        Ok(file) => warp::reply::json(&json!({ "success": true, "file": file })).into_response(),
        Err(e) => {
            warn!("Upload refused: {}", e);
            e.into_response()
        }
    })
}

async fn serve(file_id: String, query: FileQuery, ctx: Arc<FileContext>, inline: bool) -> Result<Response, Rejection> {
    Ok(ctx
        .serve(&file_id, &query, inline)
        .await
        .unwrap_or_else(TransferError::into_response))
}

async fn read_field(part: Part) -> Result<String, TransferError> {
    let chunks = part.stream();
    pin_mut!(chunks);
    let mut bytes = Vec::new();
    while let Some(mut chunk) = chunks.try_next().await.map_err(TransferError::malformed)? {
        if bytes.len() + chunk.remaining() > MAX_FIELD_LEN {
            return Err(TransferError::Malformed("form field too long".into()));
        }
        bytes.extend_from_slice(&chunk.copy_to_bytes(chunk.remaining()));
    }
    String::from_utf8(bytes)
        .map(|value| value.trim().to_owned())
        .map_err(|_| TransferError::Malformed("form field is not UTF-8".into()))
}

async fn write_blob<S, B>(chunks: S, file: &mut fs::File, limit: u64) -> Result<u64, TransferError>
where
    S: Stream<Item = Result<B, warp::Error>>,
    B: Buf,
{
    pin_mut!(chunks);
    let mut size: u64 = 0;
    while let Some(mut chunk) = chunks.try_next().await.map_err(TransferError::malformed)? {
        let bytes = chunk.copy_to_bytes(chunk.remaining());
        size += bytes.len() as u64;
        if size > limit {
            return Err(TransferError::TooLarge { limit });
        }
        file.write_all(&bytes).await?;
    }
    file.flush().await?;
    Ok(size)
}

async fn next_chunk(mut file: fs::File) -> io::Result<Option<(Vec<u8>, fs::File)>> {
    let mut buf = vec![0; READ_CHUNK];
    let n = file.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some((buf, file)))
}

/// Last path segment of a client-supplied file name.
fn base_name(raw: &str) -> &str {
    raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim()
}

fn is_header_safe(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b == b' ' || b.is_ascii_graphic())
}

/// `attachment` disposition with an ASCII fallback name and the exact
/// name percent-encoded as UTF-8.
fn attachment(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() || c == ' ') && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
