//! Component G - transfer receiver.
//!
//! [`handle_session`] drives one accepted connection end to end and is
//! generic over the stream type, so it is tested against an in-memory
//! duplex pipe the same way [`super::sender::drive_upload`] is. [`Receiver`]
//! supplies the real TLS listener and the per-connection semaphore.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslVerifyMode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_openssl::SslStream;

use crate::auth::AuthService;
use crate::catalog::models::Permission;
use crate::catalog::Catalog;
use crate::config::ListenerConfig;
use crate::error::{TransportError, TransportErrorKind};
use crate::tools::naming::{LayoutStrategy, LayoutTokens};
use crate::transfer::chunk_manager::{expected_chunk_count, ChunkManager, ChunkResult as ChunkOutcome};
use crate::transfer::protocol::{
    read_json_frame, write_json_frame, ChunkData, ChunkResult, TransferRequest, TransferResponse,
    MAX_CHUNK_FRAME, MAX_REQUEST_FRAME,
};

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

async fn read_framed<S, T>(stream: &mut S, max_len: u32) -> Result<T, TransportError>
where
    S: AsyncRead + Unpin,
    T: for<'de> serde::Deserialize<'de>,
{
    tokio::time::timeout(IDLE_TIMEOUT, read_json_frame(stream, max_len))
        .await
        .map_err(|_| TransportError::new(TransportErrorKind::Timeout, "idle timeout waiting for frame"))?
}

async fn write_framed<S, T>(stream: &mut S, value: &T) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    tokio::time::timeout(IDLE_TIMEOUT, write_json_frame(stream, value))
        .await
        .map_err(|_| TransportError::new(TransportErrorKind::Timeout, "idle timeout writing frame"))?
}

/// Drives Request → Response → (Chunk → Ack)* → Final Response for one
/// session. Returns the final archive path on success.
pub async fn handle_session<S>(
    stream: &mut S,
    chunk_manager: &ChunkManager,
    auth: &AuthService,
    catalog: &Catalog,
    layout: &LayoutStrategy,
    storage_root: &Path,
) -> Result<PathBuf, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request: TransferRequest = read_framed(stream, MAX_REQUEST_FRAME).await?;

    if let Err(err) = auth.authenticate(catalog, &request.auth.client_id, &request.auth.client_secret) {
        write_framed(stream, &TransferResponse::err(err.message.clone())).await?;
        return Err(err);
    }
    let credential = catalog
        .get_credential(&request.auth.client_id)
        .map_err(|err| TransportError::new(TransportErrorKind::Auth, err.to_string()))?
        .ok_or_else(|| TransportError::new(TransportErrorKind::Auth, "credential vanished after authentication"))?;

    let required = if request.resume_transfer {
        Permission::TRANSFER_RESUME
    } else {
        Permission::TRANSFER_UPLOAD
    };
    if let Err(err) = auth.authorize(&credential, required) {
        write_framed(stream, &TransferResponse::err(err.message.clone())).await?;
        return Err(err);
    }

    let database_name = request
        .metadata
        .source_config
        .as_ref()
        .map(|c| c.name.as_str())
        .unwrap_or(&request.metadata.filename);
    let tokens = LayoutTokens {
        server: &request.auth.client_id,
        database: database_name,
        when: request.metadata.created_at,
        kind: "full",
    };
    let target_dir = storage_root.join(layout.resolve(&tokens));

    let (transfer_id, already_received) = if request.resume_transfer {
        let token = request
            .resume_token
            .clone()
            .ok_or_else(|| TransportError::new(TransportErrorKind::Protocol, "resume_transfer set without a resume_token"))?;
        let (transfer_id, received) = chunk_manager.restore(&token, &request.metadata)?;
        write_framed(stream, &TransferResponse::ok_with_received(&received)).await?;
        (transfer_id, received)
    } else {
        let (transfer_id, token) =
            chunk_manager.initialize(request.metadata.clone(), request.chunking.chunk_size, target_dir)?;
        write_framed(stream, &TransferResponse::ok_fresh(token)).await?;
        (transfer_id, Vec::new())
    };

    let expected_chunks = expected_chunk_count(request.metadata.size, request.chunking.chunk_size);
    let remaining = expected_chunks as usize - already_received.len();

    for _ in 0..remaining {
        let chunk: ChunkData = read_framed(stream, MAX_CHUNK_FRAME).await?;
        let payload = base64::decode(&chunk.data)
            .map_err(|err| TransportError::new(TransportErrorKind::Protocol, format!("invalid base64 payload: {err}")))?;

        let outcome = chunk_manager.accept_chunk(&transfer_id, chunk.index, &payload, &chunk.sha256)?;
        match outcome {
            ChunkOutcome::Accepted | ChunkOutcome::AlreadyAccepted => {
                write_framed(stream, &ChunkResult::ok(chunk.index)).await?;
            }
            ChunkOutcome::OutOfOrder { expected } => {
                let result = ChunkResult::err(chunk.index, format!("out of order: expected {expected}"));
                write_framed(stream, &result).await?;
                return Err(TransportError::new(TransportErrorKind::Protocol, "chunk received out of order"));
            }
            ChunkOutcome::ChecksumMismatch => {
                write_framed(stream, &ChunkResult::err(chunk.index, "checksum mismatch")).await?;
                return Err(TransportError::new(TransportErrorKind::IntegrityFailure, "chunk checksum mismatch"));
            }
        }
    }

    match chunk_manager.finalize(&transfer_id) {
        Ok(final_path) => {
            write_framed(stream, &TransferResponse::ok()).await?;
            Ok(final_path)
        }
        Err(err) => {
            write_framed(stream, &TransferResponse::err(err.message.clone())).await?;
            Err(err)
        }
    }
}

pub struct Receiver {
    pub chunk_manager: Arc<ChunkManager>,
    pub auth: Arc<AuthService>,
    pub catalog: Arc<Catalog>,
    pub layout: LayoutStrategy,
    pub storage_root: PathBuf,
    connections: Arc<Semaphore>,
}

impl Receiver {
    pub fn new(
        chunk_manager: Arc<ChunkManager>,
        auth: Arc<AuthService>,
        catalog: Arc<Catalog>,
        layout: LayoutStrategy,
        storage_root: PathBuf,
        max_connections: usize,
    ) -> Self {
        Self {
            chunk_manager,
            auth,
            catalog,
            layout,
            storage_root,
            connections: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Binds the listener and serves connections until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, config: &ListenerConfig, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<(), Error> {
        let acceptor = build_acceptor(config)?;
        let listener = TcpListener::bind((config.bind_address.as_str(), config.port))
            .await
            .with_context(|| format!("unable to bind {}:{}", config.bind_address, config.port))?;
        log::info!("transfer receiver listening on {}:{}", config.bind_address, config.port);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("transfer receiver shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (tcp, peer) = accepted.context("accept failed")?;
                    let permit = match self.connections.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            log::warn!("rejecting connection from {peer}: connection limit reached");
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let receiver = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = receiver.accept_one(tcp, &acceptor).await {
                            log::warn!("session with {peer} failed: {err}");
                        }
                    });
                }
            }
        }
    }

    async fn accept_one(&self, tcp: tokio::net::TcpStream, acceptor: &SslAcceptor) -> Result<(), Error> {
        let ssl = openssl::ssl::Ssl::new(acceptor.context()).context("unable to build SSL session")?;
        let mut stream = SslStream::new(ssl, tcp).context("unable to wrap TCP stream in TLS")?;
        Pin::new(&mut stream).accept().await.context("TLS handshake failed")?;

        handle_session(
            &mut stream,
            &self.chunk_manager,
            &self.auth,
            &self.catalog,
            &self.layout,
            &self.storage_root,
        )
        .await
        .map(|_| ())
        .map_err(|err| anyhow::anyhow!(err))
    }
}

fn build_acceptor(config: &ListenerConfig) -> Result<SslAcceptor, Error> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())
        .context("unable to build TLS acceptor")?;
    builder
        .set_certificate_file(&config.tls_cert, SslFiletype::PEM)
        .with_context(|| format!("unable to load TLS certificate at '{}'", config.tls_cert.display()))?;
    builder
        .set_private_key_file(&config.tls_key, SslFiletype::PEM)
        .with_context(|| format!("unable to load TLS key at '{}'", config.tls_key.display()))?;
    if let Some(ca) = &config.client_ca {
        builder
            .set_ca_file(ca)
            .with_context(|| format!("unable to load client CA bundle at '{}'", ca.display()))?;
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    }
    Ok(builder.build())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::models::ClientCredential;
    use crate::transfer::protocol::{AuthInfo, ChunkingParams, TransferMetadata};
    use tokio::io::duplex;

    fn setup_credential(catalog: &Catalog) {
        let hash = crate::auth::hash_secret("s3cret").unwrap();
        catalog
            .upsert_credential(&ClientCredential {
                client_id: "client-a".into(),
                secret_hash: hash,
                permissions: Permission::TRANSFER_UPLOAD,
                is_active: true,
                expires_at: None,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn happy_path_single_chunk_finalizes_and_writes_the_file() {
        let catalog = Catalog::open_in_memory().unwrap();
        setup_credential(&catalog);
        let scratch = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        let manager = Arc::new(ChunkManager::new(scratch.path().to_path_buf()));
        let auth = AuthService::new();
        let layout = LayoutStrategy::FlatServer;

        let payload = vec![7u8; 8];
        let (whole_md5, whole_sha256) = {
            use md5::Digest as _;
            let mut md5 = md5::Md5::new();
            md5.update(&payload);
            let mut sha256 = sha2::Sha256::new();
            sha256.update(&payload);
            (hex::encode(md5.finalize()), hex::encode(sha256.finalize()))
        };

        let request = TransferRequest {
            metadata: TransferMetadata {
                filename: "a.bin".into(),
                size: 8,
                md5: whole_md5,
                sha256: whole_sha256,
                created_at: chrono::Utc::now(),
                source_config: None,
            },
            chunking: ChunkingParams {
                chunk_size: 8,
                max_concurrent: 1,
                parallel: false,
            },
            resume_transfer: false,
            resume_token: None,
            auth: AuthInfo {
                client_id: "client-a".into(),
                client_secret: "s3cret".into(),
            },
        };

        let (mut client, mut server) = duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            handle_session(&mut server, &manager, &auth, &catalog, &layout, storage.path()).await
        });

        write_json_frame(&mut client, &request).await.unwrap();
        let response: TransferResponse = read_json_frame(&mut client, MAX_REQUEST_FRAME).await.unwrap();
        assert!(response.success);
        assert!(response.resume_token.is_some());

        let chunk = ChunkData {
            index: 0,
            size: 8,
            sha256: crate::checksum::chunk_sha256(&payload),
            data: base64::encode(&payload),
        };
        write_json_frame(&mut client, &chunk).await.unwrap();
        let ack: ChunkResult = read_json_frame(&mut client, MAX_CHUNK_FRAME).await.unwrap();
        assert!(ack.success);

        let final_response: TransferResponse = read_json_frame(&mut client, MAX_REQUEST_FRAME).await.unwrap();
        assert!(final_response.success);

        let final_path = server_task.await.unwrap().unwrap();
        assert!(final_path.exists());
    }

    #[tokio::test]
    async fn unknown_client_is_rejected_before_any_session_state_is_created() {
        let catalog = Catalog::open_in_memory().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        let manager = Arc::new(ChunkManager::new(scratch.path().to_path_buf()));
        let auth = AuthService::new();
        let layout = LayoutStrategy::FlatServer;

        let request = TransferRequest {
            metadata: TransferMetadata {
                filename: "a.bin".into(),
                size: 8,
                md5: "x".into(),
                sha256: "y".into(),
                created_at: chrono::Utc::now(),
                source_config: None,
            },
            chunking: ChunkingParams {
                chunk_size: 8,
                max_concurrent: 1,
                parallel: false,
            },
            resume_transfer: false,
            resume_token: None,
            auth: AuthInfo {
                client_id: "nobody".into(),
                client_secret: "wrong".into(),
            },
        };

        let (mut client, mut server) = duplex(64 * 1024);
        let server_task =
            tokio::spawn(async move { handle_session(&mut server, &manager, &auth, &catalog, &layout, storage.path()).await });

        write_json_frame(&mut client, &request).await.unwrap();
        let response: TransferResponse = read_json_frame(&mut client, MAX_REQUEST_FRAME).await.unwrap();
        assert!(!response.success);

        assert!(server_task.await.unwrap().is_err());
    }
}
