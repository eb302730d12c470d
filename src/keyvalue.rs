// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Parser for `KEY=value` release and configuration files, such as the
//! payload version pin shipped next to the update engine.

use std::{collections::BTreeMap, fs, io, path::Path};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid line: {0:?}")]
    InvalidLine(String),
    #[error("Invalid boolean value for {0:?}: {1:?}")]
    InvalidBool(String, String),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Default)]
pub struct KeyValueStore {
    values: BTreeMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(data: &str) -> Result<Self> {
        let mut values = BTreeMap::new();

        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::InvalidLine(line.to_owned()));
            };

            // Values may be double quoted. Quotes are not part of the value.
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);

            values.insert(key.trim().to_owned(), value.to_owned());
        }

        Ok(Self { values })
    }

    pub fn serialize(&self) -> String {
        let mut result = String::new();

        for (key, value) in &self.values {
            result.push_str(key);
            result.push('=');
            result.push_str(value);
            result.push('\n');
        }

        result
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.values.get(key).map(String::as_str) {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(other) => Err(Error::InvalidBool(key.to_owned(), other.to_owned())),
        }
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_owned(), value.to_owned());
    }
}
