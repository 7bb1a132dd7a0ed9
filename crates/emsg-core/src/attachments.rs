use crate::config::AttachmentConfig;
use crate::error::EmsgError;
use crate::time::now_secs;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const DEFAULT_MIME: &str = "application/octet-stream";

const DOCUMENT_MIMES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "text/plain",
    "text/csv",
];

/// A file attachment: inline bytes for small payloads, ordered chunks above
/// the chunking threshold. Immutable after creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub checksum: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<AttachmentChunk>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentChunk {
    pub index: u32,
    pub size: u64,
    pub checksum: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn is_inline(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn is_chunked(&self) -> bool {
        !self.chunks.is_empty()
    }

    pub fn extension(&self) -> String {
        Path::new(&self.name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default()
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    pub fn is_document(&self) -> bool {
        DOCUMENT_MIMES.contains(&self.mime_type.as_str())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, EmsgError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, EmsgError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Creates, persists, and verifies attachments within configured limits.
pub struct AttachmentManager {
    config: AttachmentConfig,
    allowed: HashSet<String>,
}

impl AttachmentManager {
    pub fn new(config: AttachmentConfig) -> Result<Self, EmsgError> {
        if let Some(dir) = config.storage_dir.as_ref() {
            fs::create_dir_all(dir)?;
        }
        let allowed = config.allowed_types.iter().cloned().collect();
        Ok(Self { config, allowed })
    }

    pub fn create_from_file(&self, path: impl AsRef<Path>) -> Result<Attachment, EmsgError> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| EmsgError::Validation(format!("not a file: {}", path.display())))?;
        let mime_type = mime_from_extension(path);
        let mut attachment = self.create_from_data(&name, &data, &mime_type)?;
        attachment.metadata.insert(
            "original_path".to_string(),
            Value::String(path.display().to_string()),
        );
        Ok(attachment)
    }

    pub fn create_from_data(
        &self,
        name: &str,
        data: &[u8],
        mime_type: &str,
    ) -> Result<Attachment, EmsgError> {
        let size = data.len() as u64;
        if size > self.config.max_file_size {
            return Err(EmsgError::Validation(format!(
                "attachment size {} exceeds maximum {}",
                size, self.config.max_file_size
            )));
        }
        let mime_type = if mime_type.is_empty() {
            DEFAULT_MIME.to_string()
        } else {
            mime_type.to_string()
        };
        if !self.allowed.is_empty() && !self.allowed.contains(&mime_type) {
            return Err(EmsgError::Validation(format!(
                "MIME type {mime_type} not allowed"
            )));
        }

        let mut attachment = Attachment {
            id: format!("att_{}", Uuid::new_v4().simple()),
            name: name.to_string(),
            mime_type,
            size,
            checksum: checksum(data),
            created_at: now_secs(),
            data: Vec::new(),
            chunks: Vec::new(),
            metadata: Map::new(),
        };

        let inline = !self.config.enable_chunking
            || (size <= self.config.max_chunk_size && size <= self.config.inline_limit);
        if inline {
            attachment.data = data.to_vec();
        } else {
            attachment.chunks = split_chunks(data, self.config.max_chunk_size as usize);
        }
        Ok(attachment)
    }

    pub fn save(&self, attachment: &Attachment) -> Result<(), EmsgError> {
        let dir = self.storage_dir()?;
        let base = dir.join(&attachment.id);

        let meta = serde_json::to_vec(&Attachment {
            data: Vec::new(),
            chunks: attachment
                .chunks
                .iter()
                .map(|c| AttachmentChunk {
                    data: Vec::new(),
                    ..c.clone()
                })
                .collect(),
            ..attachment.clone()
        })?;
        fs::write(base.with_extension("meta"), meta)?;

        if attachment.is_inline() {
            fs::write(&base, &attachment.data)?;
        }
        for chunk in &attachment.chunks {
            fs::write(chunk_path(&base, chunk.index), &chunk.data)?;
        }
        Ok(())
    }

    pub fn load(&self, attachment_id: &str) -> Result<Attachment, EmsgError> {
        let dir = self.storage_dir()?;
        let base = dir.join(attachment_id);
        let meta = fs::read(base.with_extension("meta"))?;
        let mut attachment = Attachment::from_json(&meta)?;

        if attachment.chunks.is_empty() {
            attachment.data = fs::read(&base)?;
        } else {
            for chunk in attachment.chunks.iter_mut() {
                chunk.data = fs::read(chunk_path(&base, chunk.index))?;
            }
        }
        Ok(attachment)
    }

    /// Reassembles the content and checks both declared size and checksum.
    pub fn validate(&self, attachment: &Attachment) -> Result<(), EmsgError> {
        let data = self.get_data(attachment)?;
        if data.len() as u64 != attachment.size {
            return Err(EmsgError::Validation(format!(
                "size mismatch: expected {}, got {}",
                attachment.size,
                data.len()
            )));
        }
        let actual = checksum(&data);
        if actual != attachment.checksum {
            return Err(EmsgError::Validation(format!(
                "checksum mismatch: expected {}, got {}",
                attachment.checksum, actual
            )));
        }
        Ok(())
    }

    pub fn get_data(&self, attachment: &Attachment) -> Result<Vec<u8>, EmsgError> {
        if attachment.is_inline() {
            return Ok(attachment.data.clone());
        }
        if attachment.is_chunked() {
            let mut ordered: Vec<&AttachmentChunk> = attachment.chunks.iter().collect();
            ordered.sort_by_key(|c| c.index);
            let mut data = Vec::with_capacity(attachment.size as usize);
            for chunk in ordered {
                data.extend_from_slice(&chunk.data);
            }
            return Ok(data);
        }
        Err(EmsgError::Validation("attachment has no data".to_string()))
    }

    fn storage_dir(&self) -> Result<&PathBuf, EmsgError> {
        self.config
            .storage_dir
            .as_ref()
            .ok_or_else(|| EmsgError::State("no storage directory configured".to_string()))
    }
}

fn split_chunks(data: &[u8], chunk_size: usize) -> Vec<AttachmentChunk> {
    let chunk_size = chunk_size.max(1);
    data.chunks(chunk_size)
        .enumerate()
        .map(|(index, slice)| AttachmentChunk {
            index: index as u32,
            size: slice.len() as u64,
            checksum: checksum(slice),
            data: slice.to_vec(),
        })
        .collect()
}

fn checksum(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

fn chunk_path(base: &Path, index: u32) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(format!(".chunk.{index}"));
    PathBuf::from(path)
}

fn mime_from_extension(path: &Path) -> String {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        _ => DEFAULT_MIME,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttachmentConfig;

    fn manager(max_chunk: u64) -> AttachmentManager {
        AttachmentManager::new(AttachmentConfig {
            max_chunk_size: max_chunk,
            inline_limit: max_chunk,
            ..AttachmentConfig::default()
        })
        .expect("manager")
    }

    #[test]
    fn small_payload_stays_inline() {
        let m = manager(1024);
        let att = m
            .create_from_data("note.txt", &[7u8; 1024], "text/plain")
            .expect("create");
        assert!(att.is_inline());
        assert!(!att.is_chunked());
        assert_eq!(att.size, 1024);
    }

    #[test]
    fn one_byte_over_threshold_chunks_in_two() {
        let m = manager(1024);
        let att = m
            .create_from_data("blob.bin", &[7u8; 1025], "")
            .expect("create");
        assert!(att.is_chunked());
        assert_eq!(att.chunks.len(), 2);
        assert_eq!(att.chunks[0].size, 1024);
        assert_eq!(att.chunks[1].size, 1);
        assert_eq!(att.mime_type, DEFAULT_MIME);
    }

    #[test]
    fn chunked_roundtrip_and_corruption() {
        let m = manager(1024);
        let payload: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        let mut att = m
            .create_from_data("blob.bin", &payload, "application/zip")
            .expect("create");
        assert_eq!(att.chunks.len(), 2);
        assert_eq!(m.get_data(&att).expect("reassemble"), payload);
        m.validate(&att).expect("valid");

        att.chunks[0].data[0] ^= 0xFF;
        let err = m.validate(&att).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn file_size_boundary() {
        let config = AttachmentConfig {
            max_file_size: 2048,
            max_chunk_size: 1024,
            inline_limit: 1024,
            ..AttachmentConfig::default()
        };
        let m = AttachmentManager::new(config).expect("manager");
        assert!(m.create_from_data("ok.bin", &[0u8; 2048], "").is_ok());
        assert!(m.create_from_data("big.bin", &[0u8; 2049], "").is_err());
    }

    #[test]
    fn allow_list_is_enforced() {
        let config = AttachmentConfig {
            allowed_types: vec!["image/png".to_string()],
            ..AttachmentConfig::default()
        };
        let m = AttachmentManager::new(config).expect("manager");
        assert!(m.create_from_data("a.png", &[1u8; 4], "image/png").is_ok());
        assert!(m.create_from_data("a.pdf", &[1u8; 4], "application/pdf").is_err());
    }

    #[test]
    fn chunking_disabled_stores_inline() {
        let config = AttachmentConfig {
            max_chunk_size: 16,
            inline_limit: 16,
            enable_chunking: false,
            ..AttachmentConfig::default()
        };
        let m = AttachmentManager::new(config).expect("manager");
        let att = m.create_from_data("big.bin", &[2u8; 64], "").expect("create");
        assert!(att.is_inline());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AttachmentConfig {
            max_chunk_size: 32,
            inline_limit: 32,
            storage_dir: Some(dir.path().to_path_buf()),
            ..AttachmentConfig::default()
        };
        let m = AttachmentManager::new(config).expect("manager");

        let inline = m.create_from_data("small.txt", b"hello", "text/plain").expect("create");
        m.save(&inline).expect("save inline");
        let loaded = m.load(&inline.id).expect("load inline");
        assert_eq!(loaded.data, b"hello");
        m.validate(&loaded).expect("inline valid");

        let chunked = m.create_from_data("big.bin", &[9u8; 100], "").expect("create");
        m.save(&chunked).expect("save chunked");
        let loaded = m.load(&chunked.id).expect("load chunked");
        assert_eq!(loaded.chunks.len(), 4);
        assert_eq!(m.get_data(&loaded).expect("data"), vec![9u8; 100]);
        m.validate(&loaded).expect("chunked valid");
    }

    #[test]
    fn classification_helpers() {
        let m = manager(1024);
        let png = m.create_from_data("x.png", &[0u8; 3], "image/png").expect("create");
        assert!(png.is_image());
        let pdf = m.create_from_data("x.pdf", &[0u8; 3], "application/pdf").expect("create");
        assert!(pdf.is_document());
        let mp4 = m.create_from_data("x.mp4", &[0u8; 3], "video/mp4").expect("create");
        assert!(mp4.is_video());
        let wav = m.create_from_data("x.wav", &[0u8; 3], "audio/wav").expect("create");
        assert!(wav.is_audio());
        assert_eq!(png.extension(), ".png");
    }

    #[test]
    fn mime_detection_from_extension() {
        assert_eq!(mime_from_extension(Path::new("a/b/report.pdf")), "application/pdf");
        assert_eq!(mime_from_extension(Path::new("photo.JPG")), "image/jpeg");
        assert_eq!(mime_from_extension(Path::new("unknown.xyz")), DEFAULT_MIME);
    }

    #[test]
    fn attachment_json_roundtrip() {
        let m = manager(8);
        let att = m.create_from_data("blob.bin", &[5u8; 20], "").expect("create");
        let encoded = att.to_json().expect("serialize");
        let decoded = Attachment::from_json(&encoded).expect("deserialize");
        assert_eq!(decoded, att);
    }
}
