// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Append-only journal of registered bridge pairs.
//!
//! The file is a plain concatenation of RLP lists
//! `[child_address, parent_address, subscribed]`. New pairs are appended;
//! the whole file is rewritten by [`BridgeAddrJournal::rotate`], which writes
//! a sibling `.new` file and renames it over the journal so a crash never
//! leaves a half-written journal behind.

use crate::error::{BridgeError, BridgeResult};
use ethers::types::Address;
use ethers::utils::rlp::{self, Decodable, DecoderError, Encodable, Rlp, RlpStream};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const JOURNAL_FILE_NAME: &str = "bridge_addrs.rlp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BridgeJournalEntry {
    pub child_address: Address,
    pub parent_address: Address,
    pub subscribed: bool,
}

impl BridgeJournalEntry {
    pub fn new(child_address: Address, parent_address: Address) -> Self {
        Self {
            child_address,
            parent_address,
            subscribed: false,
        }
    }
}

impl Encodable for BridgeJournalEntry {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.child_address);
        s.append(&self.parent_address);
        s.append(&self.subscribed);
    }
}

impl Decodable for BridgeJournalEntry {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            child_address: rlp.val_at(0)?,
            parent_address: rlp.val_at(1)?,
            subscribed: rlp.val_at(2)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub total: usize,
    pub dropped: usize,
}

#[derive(Debug)]
enum JournalWriter {
    // Used while loading so entries re-inserted by the loader are not appended again
    Discard,
    File(File),
}

impl JournalWriter {
    fn write_entry(&mut self, entry: &BridgeJournalEntry) -> std::io::Result<()> {
        match self {
            JournalWriter::Discard => Ok(()),
            JournalWriter::File(file) => file.write_all(&rlp::encode(entry)),
        }
    }

    fn close(self) -> std::io::Result<()> {
        match self {
            JournalWriter::Discard => Ok(()),
            JournalWriter::File(mut file) => {
                file.flush()?;
                file.sync_all()
            }
        }
    }
}

#[derive(Debug)]
pub struct BridgeAddrJournal {
    path: PathBuf,
    writer: Option<JournalWriter>,
    // keyed by child address
    cache: BTreeMap<Address, BridgeJournalEntry>,
}

impl BridgeAddrJournal {
    /// Creates a journal bound to `path`. Nothing is read or opened until
    /// [`load`](Self::load) and [`rotate`](Self::rotate) are called.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            cache: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays the journal file, handing every decoded entry to `add`.
    /// A missing file is not an error. Decoding stops at the first corrupt
    /// record and the decode error is returned; entries delivered before it
    /// stay delivered.
    pub fn load<F>(&mut self, mut add: F) -> BridgeResult<LoadStats>
    where
        F: FnMut(&mut Self, BridgeJournalEntry) -> BridgeResult<()>,
    {
        if !self.path.exists() {
            return Ok(LoadStats::default());
        }
        let data = std::fs::read(&self.path)?;

        self.writer = Some(JournalWriter::Discard);
        let mut stats = LoadStats::default();
        let mut failure = None;
        let mut offset = 0;
        while offset < data.len() {
            match decode_record(&data[offset..]) {
                Ok((entry, consumed)) => {
                    offset += consumed;
                    stats.total += 1;
                    if let Err(e) = add(self, entry) {
                        warn!(
                            "[BridgeJournal] Dropped journal entry child={:?} parent={:?}: {:?}",
                            entry.child_address, entry.parent_address, e
                        );
                        stats.dropped += 1;
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        // Inserts are refused until the next rotation reopens the file
        self.writer = None;

        info!(
            "[BridgeJournal] Loaded local bridge journal {:?}: total={}, dropped={}",
            self.path, stats.total, stats.dropped
        );
        match failure {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    /// Appends a new pair. The subscribed flag is always written false.
    pub fn insert(&mut self, local: Address, remote: Address) -> BridgeResult<()> {
        if self.cache.contains_key(&local) {
            return Err(BridgeError::DuplicatedJournal);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or(BridgeError::NoActiveAddressJournal)?;
        if local.is_zero() || remote.is_zero() {
            return Err(BridgeError::EmptyBridgeAddress);
        }
        let entry = BridgeJournalEntry::new(local, remote);
        writer.write_entry(&entry)?;
        self.cache.insert(local, entry);
        Ok(())
    }

    /// Puts a replayed entry into the cache without touching the file.
    pub fn insert_cached(&mut self, entry: BridgeJournalEntry) -> BridgeResult<()> {
        if entry.child_address.is_zero() || entry.parent_address.is_zero() {
            return Err(BridgeError::EmptyBridgeAddress);
        }
        if self.cache.contains_key(&entry.child_address) {
            return Err(BridgeError::DuplicatedJournal);
        }
        self.cache.insert(entry.child_address, entry);
        Ok(())
    }

    /// Rewrites the journal with exactly `entries` and reopens it for appends.
    pub fn rotate(&mut self, entries: &[BridgeJournalEntry]) -> BridgeResult<()> {
        if let Some(writer) = self.writer.take() {
            writer.close()?;
        }

        let new_path = self.rotation_path();
        let mut replacement = File::create(&new_path)?;
        for entry in entries {
            replacement.write_all(&rlp::encode(entry))?;
        }
        replacement.sync_all()?;
        drop(replacement);

        std::fs::rename(&new_path, &self.path)?;
        let sink = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = Some(JournalWriter::File(sink));
        info!(
            "[BridgeJournal] Rotated bridge journal {:?} with {} entries",
            self.path,
            entries.len()
        );
        Ok(())
    }

    pub fn close(&mut self) -> BridgeResult<()> {
        if let Some(writer) = self.writer.take() {
            writer.close()?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        matches!(self.writer, Some(JournalWriter::File(_)))
    }

    pub fn get(&self, child: &Address) -> Option<&BridgeJournalEntry> {
        self.cache.get(child)
    }

    /// Changes the subscribed flag in the cache only; a rotation persists it.
    pub fn set_subscribed(&mut self, child: &Address, subscribed: bool) -> BridgeResult<()> {
        let entry = self
            .cache
            .get_mut(child)
            .ok_or(BridgeError::InvalidBridgePair)?;
        entry.subscribed = subscribed;
        Ok(())
    }

    pub fn remove(&mut self, child: &Address) -> Option<BridgeJournalEntry> {
        self.cache.remove(child)
    }

    pub fn entries(&self) -> Vec<BridgeJournalEntry> {
        self.cache.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn rotation_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".new");
        PathBuf::from(path)
    }
}

fn decode_record(data: &[u8]) -> BridgeResult<(BridgeJournalEntry, usize)> {
    let info = Rlp::new(data).payload_info()?;
    let size = info.total();
    if size > data.len() {
        return Err(DecoderError::RlpIsTooShort.into());
    }
    let entry = Rlp::new(&data[..size]).as_val::<BridgeJournalEntry>()?;
    Ok((entry, size))
}
