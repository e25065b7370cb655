//! Component E - server-side chunk manager.
//!
//! One `ChunkSession` per in-flight upload, keyed by `transfer_id`. The
//! received-chunk bitset is a `Vec<bool>` sized once at session creation,
//! not a dynamic set - an arena-per-session, not a growable map.

use std::collections::HashMap;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::RngCore;

use crate::checksum::chunk_sha256;
use crate::error::{TransportError, TransportErrorKind};
use crate::transfer::protocol::TransferMetadata;

const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

pub struct ChunkSession {
    pub metadata: TransferMetadata,
    pub expected_chunks: u32,
    pub chunk_size: u32,
    pub received: Vec<bool>,
    accepted_sha256: Vec<Option<String>>,
    pub scratch_path: PathBuf,
    pub target_dir: PathBuf,
    handle: std::fs::File,
    pub resume_token: String,
    created_at: Instant,
    last_activity: Instant,
}

impl ChunkSession {
    fn next_expected(&self) -> u32 {
        self.received
            .iter()
            .position(|done| !done)
            .map(|idx| idx as u32)
            .unwrap_or(self.expected_chunks)
    }

    fn is_expired(&self) -> bool {
        self.last_activity.elapsed() > SESSION_TTL
    }
}

pub enum ChunkResult {
    Accepted,
    AlreadyAccepted,
    OutOfOrder { expected: u32 },
    ChecksumMismatch,
}

pub struct ChunkManager {
    scratch_dir: PathBuf,
    sessions: Mutex<HashMap<String, ChunkSession>>,
    resume_index: Mutex<HashMap<String, String>>,
}

impl ChunkManager {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self {
            scratch_dir,
            sessions: Mutex::new(HashMap::new()),
            resume_index: Mutex::new(HashMap::new()),
        }
    }

    pub fn initialize(&self, metadata: TransferMetadata, chunk_size: u32, target_dir: PathBuf) -> Result<(String, String), TransportError> {
        let transfer_id = uuid::Uuid::new_v4().to_string();
        let resume_token = random_token();
        let expected_chunks = expected_chunk_count(metadata.size, chunk_size);

        let scratch_path = self.scratch_dir.join(format!("{transfer_id}.part"));
        let handle = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&scratch_path)
            .map_err(|err| TransportError::new(TransportErrorKind::Protocol, format!("unable to open scratch file: {err}")))?;
        handle
            .set_len(metadata.size)
            .map_err(|err| TransportError::new(TransportErrorKind::Protocol, format!("unable to preallocate scratch file: {err}")))?;

        let session = ChunkSession {
            metadata,
            expected_chunks,
            chunk_size,
            received: vec![false; expected_chunks as usize],
            accepted_sha256: vec![None; expected_chunks as usize],
            scratch_path,
            target_dir,
            handle,
            resume_token: resume_token.clone(),
            created_at: Instant::now(),
            last_activity: Instant::now(),
        };

        self.sessions.lock().unwrap().insert(transfer_id.clone(), session);
        self.resume_index
            .lock()
            .unwrap()
            .insert(resume_token.clone(), transfer_id.clone());

        Ok((transfer_id, resume_token))
    }

    /// Locates a prior session with a matching fingerprint and returns the
    /// already-received chunk indices.
    pub fn restore(&self, resume_token: &str, metadata: &TransferMetadata) -> Result<(String, Vec<u32>), TransportError> {
        let transfer_id = self
            .resume_index
            .lock()
            .unwrap()
            .get(resume_token)
            .cloned()
            .ok_or_else(|| TransportError::new(TransportErrorKind::ResumeConflict, "unknown resume token"))?;

        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(&transfer_id)
            .ok_or_else(|| TransportError::new(TransportErrorKind::ResumeConflict, "session expired"))?;

        if session.metadata.sha256 != metadata.sha256 || session.metadata.size != metadata.size {
            return Err(TransportError::new(
                TransportErrorKind::ResumeConflict,
                "fingerprint or size mismatch for resume token",
            ));
        }

        session.last_activity = Instant::now();
        let received = session
            .received
            .iter()
            .enumerate()
            .filter(|(_, done)| **done)
            .map(|(idx, _)| idx as u32)
            .collect();

        Ok((transfer_id, received))
    }

    pub fn accept_chunk(
        &self,
        transfer_id: &str,
        index: u32,
        payload: &[u8],
        declared_sha256: &str,
    ) -> Result<ChunkResult, TransportError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(transfer_id)
            .ok_or_else(|| TransportError::new(TransportErrorKind::Protocol, "unknown transfer id"))?;
        session.last_activity = Instant::now();

        if index >= session.expected_chunks {
            return Err(TransportError::new(TransportErrorKind::Protocol, "chunk index out of range"));
        }

        let expected = session.next_expected();
        if index < expected {
            // Idempotent replay of an already-accepted chunk: the re-presented
            // payload and its declared hash must both match what was actually
            // accepted at this index, not just agree with each other.
            let actual = chunk_sha256(payload);
            let accepted = session.accepted_sha256[index as usize].as_deref().unwrap_or("");
            return if actual == declared_sha256 && actual == accepted {
                Ok(ChunkResult::AlreadyAccepted)
            } else {
                Ok(ChunkResult::ChecksumMismatch)
            };
        }
        if index > expected {
            return Ok(ChunkResult::OutOfOrder { expected });
        }

        if chunk_sha256(payload) != declared_sha256 {
            return Ok(ChunkResult::ChecksumMismatch);
        }

        let offset = index as u64 * session.chunk_size as u64;
        session
            .handle
            .write_at(payload, offset)
            .map_err(|err| TransportError::new(TransportErrorKind::Protocol, format!("chunk write failed: {err}")))?;
        session.received[index as usize] = true;
        session.accepted_sha256[index as usize] = Some(declared_sha256.to_owned());

        Ok(ChunkResult::Accepted)
    }

    /// Requires every bit set, verifies the whole file, and relocates the
    /// scratch file into the target directory.
    pub fn finalize(&self, transfer_id: &str) -> Result<PathBuf, TransportError> {
        let (scratch_path, target_dir, filename, declared_md5, declared_sha256, all_received) = {
            let sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get(transfer_id)
                .ok_or_else(|| TransportError::new(TransportErrorKind::Protocol, "unknown transfer id"))?;
            (
                session.scratch_path.clone(),
                session.target_dir.clone(),
                session.metadata.filename.clone(),
                session.metadata.md5.clone(),
                session.metadata.sha256.clone(),
                session.received.iter().all(|done| *done),
            )
        };

        if !all_received {
            return Err(TransportError::new(TransportErrorKind::Protocol, "not all chunks received"));
        }

        let (md5_hex, sha256_hex) = crate::checksum::checksum_file(&scratch_path)
            .map_err(|err| TransportError::new(TransportErrorKind::IntegrityFailure, err.to_string()))?;

        if md5_hex != declared_md5 || sha256_hex != declared_sha256 {
            let _ = std::fs::remove_file(&scratch_path);
            self.sessions.lock().unwrap().remove(transfer_id);
            return Err(TransportError::new(
                TransportErrorKind::IntegrityFailure,
                "whole-file checksum mismatch after reassembly",
            ));
        }

        std::fs::create_dir_all(&target_dir)
            .map_err(|err| TransportError::new(TransportErrorKind::Protocol, format!("unable to create target dir: {err}")))?;
        let final_path = sanitized_target(&target_dir, &filename);
        std::fs::rename(&scratch_path, &final_path)
            .map_err(|err| TransportError::new(TransportErrorKind::Protocol, format!("unable to move scratch file: {err}")))?;

        self.sessions.lock().unwrap().remove(transfer_id);
        Ok(final_path)
    }

    /// Removes sessions whose TTL has expired. Runs on its own scheduling
    /// unit - a periodic task spawned by the receiver.
    pub fn sweep_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.is_expired())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                let _ = std::fs::remove_file(&session.scratch_path);
                self.resume_index.lock().unwrap().retain(|_, v| v != id);
            }
        }
        expired.len()
    }

    pub fn session_age(&self, transfer_id: &str) -> Option<Duration> {
        self.sessions.lock().unwrap().get(transfer_id).map(|s| s.created_at.elapsed())
    }
}

pub fn expected_chunk_count(size: u64, chunk_size: u32) -> u32 {
    if size == 0 {
        return 1;
    }
    ((size + chunk_size as u64 - 1) / chunk_size as u64) as u32
}

fn random_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::encode(bytes)
}

fn sanitized_target(target_dir: &Path, filename: &str) -> PathBuf {
    target_dir.join(crate::tools::naming::sanitize(filename))
}

#[cfg(test)]
mod test {
    use super::*;

    fn metadata(size: u64) -> TransferMetadata {
        TransferMetadata {
            filename: "a.bin".into(),
            size,
            md5: String::new(),
            sha256: String::new(),
            created_at: Utc::now(),
            source_config: None,
        }
    }

    #[test]
    fn expected_chunk_count_handles_exact_multiples_and_remainders() {
        assert_eq!(expected_chunk_count(0, 8), 1);
        assert_eq!(expected_chunk_count(16, 8), 2);
        assert_eq!(expected_chunk_count(17, 8), 3);
        assert_eq!(expected_chunk_count(1, 8), 1);
    }

    #[test]
    fn out_of_order_chunk_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ChunkManager::new(dir.path().to_path_buf());
        let (id, _token) = manager
            .initialize(metadata(16), 8, dir.path().join("target"))
            .unwrap();

        let payload = vec![0u8; 8];
        let sha = chunk_sha256(&payload);
        let result = manager.accept_chunk(&id, 1, &payload, &sha).unwrap();
        assert!(matches!(result, ChunkResult::OutOfOrder { expected: 0 }));
    }

    #[test]
    fn replaying_an_accepted_chunk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ChunkManager::new(dir.path().to_path_buf());
        let (id, _token) = manager
            .initialize(metadata(8), 8, dir.path().join("target"))
            .unwrap();

        let payload = vec![7u8; 8];
        let sha = chunk_sha256(&payload);
        assert!(matches!(manager.accept_chunk(&id, 0, &payload, &sha).unwrap(), ChunkResult::Accepted));
        assert!(matches!(
            manager.accept_chunk(&id, 0, &payload, &sha).unwrap(),
            ChunkResult::AlreadyAccepted
        ));
    }

    #[test]
    fn replaying_with_a_different_payload_is_a_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ChunkManager::new(dir.path().to_path_buf());
        let (id, _token) = manager
            .initialize(metadata(8), 8, dir.path().join("target"))
            .unwrap();

        let payload = vec![7u8; 8];
        let sha = chunk_sha256(&payload);
        manager.accept_chunk(&id, 0, &payload, &sha).unwrap();

        let different = vec![9u8; 8];
        let result = manager.accept_chunk(&id, 0, &different, &sha).unwrap();
        assert!(matches!(result, ChunkResult::ChecksumMismatch));
    }

    #[test]
    fn finalize_requires_every_chunk_and_verifies_whole_file_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ChunkManager::new(dir.path().to_path_buf());

        let payload = vec![5u8; 8];
        let (whole_md5, whole_sha256) = {
            use md5::Digest as _;
            let mut md5 = md5::Md5::new();
            md5.update(&payload);
            let mut sha256 = sha2::Sha256::new();
            sha256.update(&payload);
            (hex::encode(md5.finalize()), hex::encode(sha256.finalize()))
        };

        let mut meta = metadata(8);
        meta.md5 = whole_md5;
        meta.sha256 = whole_sha256;

        let (id, _token) = manager.initialize(meta, 8, dir.path().join("target")).unwrap();
        let sha = chunk_sha256(&payload);

        assert!(manager.finalize(&id).is_err());
        manager.accept_chunk(&id, 0, &payload, &sha).unwrap();
        let final_path = manager.finalize(&id).unwrap();
        assert!(final_path.exists());
    }

    #[test]
    fn restore_rejects_mismatched_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ChunkManager::new(dir.path().to_path_buf());
        let mut meta = metadata(16);
        meta.sha256 = "aaaa".into();
        let (_id, token) = manager.initialize(meta, 8, dir.path().join("target")).unwrap();

        let mut different = metadata(16);
        different.sha256 = "bbbb".into();
        let result = manager.restore(&token, &different);
        assert!(result.is_err());
    }
}
