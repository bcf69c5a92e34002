//! RocksDB-backed ledger tables.
//!
//! One column family per table: blocks, transactions, used outputs, the
//! height index, the address index, minted coins, the contract log and the
//! validator log. All keys that carry a height or a log index are big-endian
//! so RocksDB's byte order matches numeric order.
//!
//! Writes only happen inside a batch. At most one batch is open at a time;
//! [`ChainDb::begin_batch`] waits for the current one to finish. The thread
//! that opened the batch is the only one allowed to stage writes, and only
//! its reads see them. Commit lands every staged table in one atomic
//! [`WriteBatch`].

use std::collections::BTreeMap;
use std::path::Path;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch, WriteOptions};
use tracing::{debug, info};

use forkline_core::codec::{self, BlockRecord};
use forkline_core::constants::{ADDRESS_LEN, POSITION_INDEX_STRIDE};
use forkline_core::contract::{ContractRecord, MintCoinMessage, ValidatorRecord};
use forkline_core::error::{ConsistencyError, ForklineError, FormatError};
use forkline_core::traits::SpendIndex;
use forkline_core::types::{Address, Block, Hash256, Transaction};

const TABLE_COUNT: usize = 8;

/// Ledger tables, one RocksDB column family each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    /// block hash → block record
    Block,
    /// txid → tx record
    Tx,
    /// txid → sorted used output indexes
    UsedIndex,
    /// height (u32 BE) → block hash
    BlockIndex,
    /// address ‖ txid ‖ output index → coin id, amount, spent
    AddressIndex,
    /// coin id (u32 BE) ‖ sequence (u32 BE) → txid ‖ mint message
    Coins,
    /// contract ‖ log index (u64 BE) → contract record
    Contract,
    /// validator ‖ log index (u64 BE) → validator record
    Validator,
}

impl Table {
    pub const ALL: [Table; TABLE_COUNT] = [
        Table::Block,
        Table::Tx,
        Table::UsedIndex,
        Table::BlockIndex,
        Table::AddressIndex,
        Table::Coins,
        Table::Contract,
        Table::Validator,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Block => "block",
            Table::Tx => "tx",
            Table::UsedIndex => "used_index",
            Table::BlockIndex => "block_index",
            Table::AddressIndex => "address_index",
            Table::Coins => "coins",
            Table::Contract => "contract",
            Table::Validator => "validator",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Value of an address index entry: `coin_id u32, amount u64, spent u8`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressEntry {
    pub coin_id: u32,
    pub amount: u64,
    pub spent: bool,
}

impl AddressEntry {
    const SIZE: usize = 13;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.coin_id.to_be_bytes());
        out.extend_from_slice(&self.amount.to_be_bytes());
        out.push(u8::from(self.spent));
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() != Self::SIZE {
            return Err(FormatError::LengthMismatch { expected: Self::SIZE, actual: bytes.len() });
        }
        let mut coin = [0u8; 4];
        coin.copy_from_slice(&bytes[..4]);
        let mut amount = [0u8; 8];
        amount.copy_from_slice(&bytes[4..12]);
        Ok(Self {
            coin_id: u32::from_be_bytes(coin),
            amount: u64::from_be_bytes(amount),
            spent: bytes[12] != 0,
        })
    }
}

/// One minted-coin registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoinEntry {
    pub sequence: u32,
    pub txid: Hash256,
    pub message: MintCoinMessage,
}

fn address_key(address: &Address, txid: &Hash256, index: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(ADDRESS_LEN + 33);
    key.extend_from_slice(address.as_bytes());
    key.extend_from_slice(txid.as_bytes());
    key.push(index);
    key
}

fn log_key(address: &Address, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(ADDRESS_LEN + 8);
    key.extend_from_slice(address.as_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn log_index(key: &[u8]) -> Result<u64, FormatError> {
    let tail: [u8; 8] = key
        .get(ADDRESS_LEN..ADDRESS_LEN + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or(FormatError::LengthMismatch { expected: ADDRESS_LEN + 8, actual: key.len() })?;
    Ok(u64::from_be_bytes(tail))
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Log index of the transaction at `position` in the block at `height`.
pub fn position_index(height: u32, position: usize) -> u64 {
    u64::from(height) * POSITION_INDEX_STRIDE + position as u64
}

/// Writes staged by the batch owner, per table.
struct StagedBatch {
    owner: ThreadId,
    tables: [BTreeMap<Vec<u8>, Vec<u8>>; TABLE_COUNT],
}

/// RocksDB-backed ledger tables with a single owned batch.
pub struct ChainDb {
    db: DB,
    batch: Mutex<Option<StagedBatch>>,
    released: Condvar,
    sync_writes: bool,
}

impl ChainDb {
    /// Open or create the store at `path`, creating missing column families.
    pub fn open(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self, ForklineError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Table::ALL
            .iter()
            .map(|table| ColumnFamilyDescriptor::new(table.name(), Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| ForklineError::Storage(e.to_string()))?;
        info!(path = %path.as_ref().display(), "chain store opened");

        Ok(Self { db, batch: Mutex::new(None), released: Condvar::new(), sync_writes })
    }

    fn cf_handle(&self, table: Table) -> Result<&rocksdb::ColumnFamily, ForklineError> {
        self.db
            .cf_handle(table.name())
            .ok_or_else(|| ForklineError::Storage(format!("missing column family: {}", table.name())))
    }

    // --- Batch lifecycle ---

    /// Open the batch, waiting up to `timeout` (forever when `None`) for a
    /// batch held by another thread to finish.
    ///
    /// The returned guard rolls back on drop unless committed.
    pub fn begin_batch(&self, timeout: Option<Duration>) -> Result<BatchGuard<'_>, ForklineError> {
        let me = thread::current().id();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.batch.lock();
        while let Some(open) = slot.as_ref() {
            if open.owner == me {
                return Err(ForklineError::Batch("batch already open on this thread".into()));
            }
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut slot, deadline).timed_out() && slot.is_some() {
                        return Err(ForklineError::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => self.released.wait(&mut slot),
            }
        }
        *slot = Some(StagedBatch { owner: me, tables: Default::default() });
        debug!("batch opened");
        Ok(BatchGuard { db: self, finished: false })
    }

    /// True while any thread holds the batch.
    pub fn has_open_batch(&self) -> bool {
        self.batch.lock().is_some()
    }

    fn commit_batch(&self) -> Result<usize, ForklineError> {
        let me = thread::current().id();
        let tables = {
            let mut slot = self.batch.lock();
            match slot.as_mut() {
                Some(open) if open.owner == me => std::mem::take(&mut open.tables),
                _ => return Err(ForklineError::Batch("commit without an owned batch".into())),
            }
        };
        let result = self.write_tables(&tables);
        *self.batch.lock() = None;
        self.released.notify_all();
        let count = result?;
        debug!(entries = count, "batch committed");
        Ok(count)
    }

    fn write_tables(&self, tables: &[BTreeMap<Vec<u8>, Vec<u8>>; TABLE_COUNT]) -> Result<usize, ForklineError> {
        let mut batch = WriteBatch::default();
        let mut count = 0;
        for table in Table::ALL {
            let cf = self.cf_handle(table)?;
            for (key, value) in &tables[table.slot()] {
                batch.put_cf(cf, key, value);
                count += 1;
            }
        }
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts).map_err(|e| ForklineError::Storage(e.to_string()))?;
        Ok(count)
    }

    fn rollback_batch(&self) {
        let me = thread::current().id();
        let mut slot = self.batch.lock();
        if slot.as_ref().is_some_and(|open| open.owner == me) {
            *slot = None;
            self.released.notify_all();
            debug!("batch rolled back");
        }
    }

    // --- Raw access ---

    fn staged_get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
        let slot = self.batch.lock();
        let open = slot.as_ref()?;
        if open.owner != thread::current().id() {
            return None;
        }
        open.tables[table.slot()].get(key).cloned()
    }

    /// Read a value. The batch owner sees its own staged writes.
    pub fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, ForklineError> {
        if let Some(value) = self.staged_get(table, key) {
            return Ok(Some(value));
        }
        let cf = self.cf_handle(table)?;
        self.db.get_cf(cf, key).map_err(|e| ForklineError::Storage(e.to_string()))
    }

    /// Stage a write. Fails unless the calling thread owns the batch.
    pub fn put(&self, table: Table, key: Vec<u8>, value: Vec<u8>) -> Result<(), ForklineError> {
        let mut slot = self.batch.lock();
        match slot.as_mut() {
            Some(open) if open.owner == thread::current().id() => {
                open.tables[table.slot()].insert(key, value);
                Ok(())
            }
            _ => Err(ForklineError::Batch(format!("write to {} outside an owned batch", table.name()))),
        }
    }

    /// Entries with `start <= key < end` in key order, staged writes merged in.
    pub fn scan(
        &self,
        table: Table,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ForklineError> {
        let cf = self.cf_handle(table)?;
        let mut merged = BTreeMap::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(start, Direction::Forward)) {
            let (key, value) = item.map_err(|e| ForklineError::Storage(e.to_string()))?;
            if end.is_some_and(|end| &*key >= end) {
                break;
            }
            merged.insert(key.to_vec(), value.to_vec());
        }
        {
            let slot = self.batch.lock();
            if let Some(open) = slot.as_ref().filter(|open| open.owner == thread::current().id()) {
                for (key, value) in open.tables[table.slot()].range(start.to_vec()..) {
                    if end.is_some_and(|end| key.as_slice() >= end) {
                        break;
                    }
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    pub fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ForklineError> {
        let end = prefix_end(prefix);
        self.scan(table, prefix, end.as_deref())
    }

    // --- Blocks ---

    /// Stage the block record and its height index entry.
    pub fn write_block(&self, block: &Block) -> Result<(), ForklineError> {
        let hash = block.hash();
        let record = BlockRecord {
            height: block.height,
            work_hash: block.work_hash,
            header: block.header,
            consensus: block.consensus,
            txids: block.txids()?,
        };
        self.put(Table::Block, hash.0.to_vec(), record.encode())?;
        self.put(Table::BlockIndex, block.height.to_be_bytes().to_vec(), hash.0.to_vec())
    }

    pub fn read_block_record(&self, hash: &Hash256) -> Result<Option<BlockRecord>, ForklineError> {
        match self.get(Table::Block, hash.as_bytes())? {
            Some(bytes) => Ok(Some(BlockRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn read_block_hash(&self, height: u32) -> Result<Option<Hash256>, ForklineError> {
        match self.get(Table::BlockIndex, &height.to_be_bytes())? {
            Some(bytes) => Ok(Some(Hash256::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn read_block_record_at(&self, height: u32) -> Result<Option<BlockRecord>, ForklineError> {
        match self.read_block_hash(height)? {
            Some(hash) => self.read_block_record(&hash),
            None => Ok(None),
        }
    }

    /// Rebuild a persisted block with its transactions.
    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ForklineError> {
        let Some(record) = self.read_block_record(hash)? else {
            return Ok(None);
        };
        let mut transactions = Vec::with_capacity(record.txids.len());
        for txid in &record.txids {
            let tx = self
                .read_tx(txid)?
                .ok_or_else(|| ConsistencyError::MissingTx(txid.to_string()))?;
            transactions.push(tx);
        }
        let mut block = Block::new(record.header, record.consensus, transactions);
        block.height = record.height;
        block.work_hash = record.work_hash;
        Ok(Some(block))
    }

    /// Log index of `txid` inside the persisted block at `height`.
    pub fn tx_position_index(&self, height: u32, txid: &Hash256) -> Result<u64, ForklineError> {
        let record = self
            .read_block_record_at(height)?
            .ok_or(ConsistencyError::MissingHeight(height))?;
        let position = record
            .position_of(txid)
            .ok_or_else(|| ConsistencyError::NotInBlock(txid.to_string()))?;
        Ok(position_index(height, position))
    }

    // --- Transactions and spends ---

    pub fn write_tx(&self, tx: &Transaction) -> Result<(), ForklineError> {
        let txid = tx.txid()?;
        self.put(Table::Tx, txid.0.to_vec(), codec::encode_tx_record(tx)?)
    }

    pub fn read_tx(&self, txid: &Hash256) -> Result<Option<Transaction>, ForklineError> {
        match self.get(Table::Tx, txid.as_bytes())? {
            Some(bytes) => Ok(Some(codec::decode_tx_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Sorted output indexes of `txid` already consumed.
    pub fn read_used_index(&self, txid: &Hash256) -> Result<Vec<u8>, ForklineError> {
        Ok(self.get(Table::UsedIndex, txid.as_bytes())?.unwrap_or_default())
    }

    /// Record `txid:index` as consumed. Fails if it already was.
    pub fn mark_used(&self, txid: &Hash256, index: u8) -> Result<(), ForklineError> {
        let mut used = self.read_used_index(txid)?;
        match used.binary_search(&index) {
            Ok(_) => Err(ConsistencyError::DoubleSpend { txid: txid.to_string(), index }.into()),
            Err(pos) => {
                used.insert(pos, index);
                self.put(Table::UsedIndex, txid.0.to_vec(), used)
            }
        }
    }

    // --- Address index ---

    pub fn write_address_index(
        &self,
        address: &Address,
        txid: &Hash256,
        index: u8,
        entry: AddressEntry,
    ) -> Result<(), ForklineError> {
        self.put(Table::AddressIndex, address_key(address, txid, index), entry.encode())
    }

    pub fn read_address_index(
        &self,
        address: &Address,
        txid: &Hash256,
        index: u8,
    ) -> Result<Option<AddressEntry>, ForklineError> {
        match self.get(Table::AddressIndex, &address_key(address, txid, index))? {
            Some(bytes) => Ok(Some(AddressEntry::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every indexed output of `address` as `(txid, index, entry)`.
    pub fn address_entries(&self, address: &Address) -> Result<Vec<(Hash256, u8, AddressEntry)>, ForklineError> {
        self.scan_prefix(Table::AddressIndex, address.as_bytes())?
            .into_iter()
            .map(|(key, value)| {
                let txid = Hash256::from_slice(key.get(ADDRESS_LEN..ADDRESS_LEN + 32).unwrap_or_default())?;
                let index = *key.last().unwrap_or(&0);
                Ok((txid, index, AddressEntry::decode(&value)?))
            })
            .collect()
    }

    // --- Coins ---

    /// Append a registration for `message.coin_id`; returns its sequence.
    pub fn write_coins(&self, txid: &Hash256, message: &MintCoinMessage) -> Result<u32, ForklineError> {
        let sequence = self
            .read_coins(message.coin_id)?
            .last()
            .map_or(0, |entry| entry.sequence + 1);
        let mut key = message.coin_id.to_be_bytes().to_vec();
        key.extend_from_slice(&sequence.to_be_bytes());
        let mut value = txid.0.to_vec();
        value.extend_from_slice(&message.encode()?);
        self.put(Table::Coins, key, value)?;
        debug!(coin_id = message.coin_id, sequence, "coin registration staged");
        Ok(sequence)
    }

    pub fn read_coins(&self, coin_id: u32) -> Result<Vec<CoinEntry>, ForklineError> {
        self.scan_prefix(Table::Coins, &coin_id.to_be_bytes())?
            .into_iter()
            .map(|(key, value)| {
                let mut seq = [0u8; 4];
                seq.copy_from_slice(key.get(4..8).unwrap_or(&[0; 4]));
                if value.len() < 32 {
                    return Err(FormatError::Truncated { needed: 32, available: value.len() }.into());
                }
                Ok(CoinEntry {
                    sequence: u32::from_be_bytes(seq),
                    txid: Hash256::from_slice(&value[..32])?,
                    message: MintCoinMessage::decode(&value[32..])?,
                })
            })
            .collect()
    }

    // --- Contract and validator logs ---

    /// Fails when `address` already has an entry at or after `index`.
    fn ensure_newest(&self, table: Table, address: &Address, index: u64) -> Result<(), ForklineError> {
        let end = prefix_end(address.as_bytes());
        let later = self.scan(table, &log_key(address, index), end.as_deref())?;
        match later.last() {
            Some((key, _)) => Err(ConsistencyError::OlderThanLast {
                address: address.to_string(),
                index,
                last: log_index(key)?,
            }
            .into()),
            None => Ok(()),
        }
    }

    pub fn write_contract(&self, contract: &Address, index: u64, record: &ContractRecord) -> Result<(), ForklineError> {
        self.ensure_newest(Table::Contract, contract, index)?;
        self.put(Table::Contract, log_key(contract, index), record.encode()?)
    }

    /// Contract log entries of `contract` with index `>= from`, oldest first.
    pub fn contract_history(&self, contract: &Address, from: u64) -> Result<ContractHistory, ForklineError> {
        let end = prefix_end(contract.as_bytes());
        let entries = self.scan(Table::Contract, &log_key(contract, from), end.as_deref())?;
        Ok(ContractHistory { entries: entries.into_iter() })
    }

    pub fn write_validator(&self, validator: &Address, index: u64, record: &ValidatorRecord) -> Result<(), ForklineError> {
        self.ensure_newest(Table::Validator, validator, index)?;
        self.put(Table::Validator, log_key(validator, index), record.encode())
    }

    pub fn validator_history(&self, validator: &Address) -> Result<Vec<(u64, ValidatorRecord)>, ForklineError> {
        self.scan_prefix(Table::Validator, validator.as_bytes())?
            .into_iter()
            .map(|(key, value)| Ok((log_index(&key)?, ValidatorRecord::decode(&value)?)))
            .collect()
    }
}

impl SpendIndex for ChainDb {
    fn is_spent(&self, txid: &Hash256, index: u8) -> Result<bool, ForklineError> {
        Ok(self.read_used_index(txid)?.binary_search(&index).is_ok())
    }
}

/// Lazily decoded contract log entries.
pub struct ContractHistory {
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for ContractHistory {
    type Item = Result<(u64, ContractRecord), ForklineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = self.entries.next()?;
        Some(
            log_index(&key)
                .and_then(|index| Ok((index, ContractRecord::decode(&value)?)))
                .map_err(ForklineError::from),
        )
    }
}

/// An open batch. Rolls back on drop unless [`commit`](Self::commit)ted.
pub struct BatchGuard<'a> {
    db: &'a ChainDb,
    finished: bool,
}

impl BatchGuard<'_> {
    /// Write every staged entry atomically and release the batch.
    pub fn commit(mut self) -> Result<usize, ForklineError> {
        self.finished = true;
        self.db.commit_batch()
    }

    /// Discard every staged entry and release the batch.
    pub fn rollback(mut self) {
        self.finished = true;
        self.db.rollback_batch();
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.db.rollback_batch();
        }
    }
}
