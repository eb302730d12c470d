// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Persistent key/value state that survives a process restart, plus the
//! checkpoint record the applier stores there between operations.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use thiserror::Error;

use crate::keyvalue::{self, KeyValueStore};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid prefs key: {0:?}")]
    InvalidKey(String),
    #[error("Missing checkpoint field: {0:?}")]
    MissingField(&'static str),
    #[error("Invalid checkpoint field {0:?}: {1:?}")]
    InvalidField(&'static str, String),
    #[error("Key/value error")]
    KeyValue(#[from] keyvalue::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

pub trait Prefs: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> io::Result<()>;
    fn remove(&self, key: &str) -> io::Result<()>;
}

/// File-per-key store rooted at a state directory.
pub struct FsPrefs {
    dir: PathBuf,
}

impl FsPrefs {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_owned() }
    }

    fn path_for(&self, key: &str) -> Option<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return None;
        }

        Some(self.dir.join(key))
    }
}

impl Prefs for FsPrefs {
    fn get(&self, key: &str) -> Option<String> {
        fs::read_to_string(self.path_for(key)?).ok()
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        let path = self
            .path_for(key)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid prefs key"))?;

        fs::create_dir_all(&self.dir)?;
        fs::write(path, value)
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        let path = self
            .path_for(key)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid prefs key"))?;

        match fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            r => r,
        }
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemPrefs {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemPrefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Prefs for MemPrefs {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Resume state written after every completed install operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub major_version: u64,
    /// Total metadata size of the payload this checkpoint belongs to.
    pub metadata_size: u64,
    /// SHA-256 of the serialized manifest, to detect a changed payload.
    pub manifest_digest: [u8; 32],
    /// Index of the next operation to execute.
    pub next_operation: usize,
    /// Bytes of the data region consumed so far.
    pub data_offset: u64,
    /// Serialized midstate of the running payload digest.
    pub sha256_state: String,
}

impl Checkpoint {
    pub fn key(payload_id: &str) -> String {
        format!("update-checkpoint-{payload_id}")
    }

    pub fn store(&self, prefs: &dyn Prefs, payload_id: &str) -> Result<()> {
        let mut kv = KeyValueStore::new();
        kv.set_string("MAJOR_VERSION", &self.major_version.to_string());
        kv.set_string("METADATA_SIZE", &self.metadata_size.to_string());
        kv.set_string("MANIFEST_DIGEST", &hex::encode(self.manifest_digest));
        kv.set_string("NEXT_OPERATION", &self.next_operation.to_string());
        kv.set_string("DATA_OFFSET", &self.data_offset.to_string());
        kv.set_string("SHA256_STATE", &self.sha256_state);

        prefs.set(&Self::key(payload_id), &kv.serialize())?;

        Ok(())
    }

    pub fn load(prefs: &dyn Prefs, payload_id: &str) -> Result<Option<Self>> {
        let Some(raw) = prefs.get(&Self::key(payload_id)) else {
            return Ok(None);
        };

        let kv = KeyValueStore::parse(&raw)?;

        let digest_field = field(&kv, "MANIFEST_DIGEST")?;
        let manifest_digest: [u8; 32] = hex::decode(digest_field)
            .ok()
            .and_then(|raw| raw.try_into().ok())
            .ok_or_else(|| Error::InvalidField("MANIFEST_DIGEST", digest_field.to_owned()))?;

        Ok(Some(Self {
            major_version: field_u64(&kv, "MAJOR_VERSION")?,
            metadata_size: field_u64(&kv, "METADATA_SIZE")?,
            manifest_digest,
            next_operation: field_u64(&kv, "NEXT_OPERATION")? as usize,
            data_offset: field_u64(&kv, "DATA_OFFSET")?,
            sha256_state: field(&kv, "SHA256_STATE")?.to_owned(),
        }))
    }

    pub fn clear(prefs: &dyn Prefs, payload_id: &str) -> io::Result<()> {
        prefs.remove(&Self::key(payload_id))
    }
}

fn field<'a>(kv: &'a KeyValueStore, name: &'static str) -> Result<&'a str> {
    kv.get_string(name).ok_or(Error::MissingField(name))
}

fn field_u64(kv: &KeyValueStore, name: &'static str) -> Result<u64> {
    let value = field(kv, name)?;

    value
        .parse::<u64>()
        .map_err(|_| Error::InvalidField(name, value.to_owned()))
}
