//! UTXO store
//!
//! `UtxoStore` keeps the per-address output namespaces, the global `(txid, vout)` index, the
//! spent ledger, the sync cursors and the watched address registry on top of any
//! `KeyValueBackend`. One coarse read-write lock serializes access: reads may run concurrently,
//! any write excludes everything else. The in-memory address mirror lives under the same lock.
//!
//! Point lookups surface decode errors to the caller. Bulk scans log and skip records that
//! fail to decode so one bad record does not hide the rest of an address.

use super::backend::{Bucket, KeyValueBackend, MemoryBackend};
use super::sled::SledBackend;
use super::types::*;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

pub const DEFAULT_COINBASE_MATURITY: u64 = 720;

const TX_CURSOR_KEY: &[u8] = b"last_tx_block_order";
const COINBASE_CURSOR_KEY: &[u8] = b"last_coinbase_block_order";
const HEIGHT_KEY: &[u8] = b"last_height";

#[derive(Debug, Default)]
struct AddressRegistry {
	addresses: HashSet<String>,
}

pub struct UtxoStore {
	backend: Box<dyn KeyValueBackend>,
	registry: RwLock<AddressRegistry>,
	/// Coinbase maturity applied when answering spendable-balance queries.
	coinbase_maturity: AtomicU64,
}

impl UtxoStore {
	/// Open a store over `backend`, loading the watched address registry.
	pub fn open(backend: impl KeyValueBackend + 'static) -> Result<Self, StoreError> {
		let backend: Box<dyn KeyValueBackend> = Box::new(backend);
		let mut addresses = HashSet::new();
		for (key, _) in backend.scan(&Bucket::Addresses)? {
			match String::from_utf8(key) {
				Ok(address) => {
					addresses.insert(address);
				}
				Err(e) => warn!("Skipping non UTF-8 address key: {}", e),
			}
		}

		info!("Opened UTXO store with {} watched addresses", addresses.len());

		Ok(Self {
			backend,
			registry: RwLock::new(AddressRegistry { addresses }),
			coinbase_maturity: AtomicU64::new(DEFAULT_COINBASE_MATURITY),
		})
	}

	pub fn open_sled<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
		Self::open(SledBackend::open(path)?)
	}

	pub fn in_memory() -> Result<Self, StoreError> {
		Self::open(MemoryBackend::new())
	}

	pub fn set_coinbase_maturity(&self, maturity: u64) {
		self.coinbase_maturity.store(maturity, Ordering::Relaxed);
	}

	pub fn coinbase_maturity(&self) -> u64 {
		self.coinbase_maturity.load(Ordering::Relaxed)
	}

	fn read(&self) -> Result<RwLockReadGuard<'_, AddressRegistry>, StoreError> {
		self.registry.read().map_err(|_| StoreError::LockPoisoned)
	}

	fn write(&self) -> Result<RwLockWriteGuard<'_, AddressRegistry>, StoreError> {
		self.registry.write().map_err(|_| StoreError::LockPoisoned)
	}

	// Address registry

	/// Register a watched address. Registering a known address is a no-op.
	pub fn insert_address(&self, address: &str) -> Result<(), StoreError> {
		let mut registry = self.write()?;
		if registry.addresses.contains(address) {
			return Ok(());
		}
		self.backend
			.put(&Bucket::Addresses, address.as_bytes(), &[])?;
		registry.addresses.insert(address.to_string());
		debug!("Watching address {}", address);
		Ok(())
	}

	pub fn address_exists(&self, address: &str) -> Result<bool, StoreError> {
		Ok(self.read()?.addresses.contains(address))
	}

	/// Watched addresses in lexical order.
	pub fn list_addresses(&self) -> Result<Vec<String>, StoreError> {
		let mut addresses: Vec<String> = self.read()?.addresses.iter().cloned().collect();
		addresses.sort();
		Ok(addresses)
	}

	// Outputs

	/// Write `utxo` to the global index, replacing any previous record.
	pub fn save_utxo(&self, utxo: &Utxo) -> Result<(), StoreError> {
		let _guard = self.write()?;
		self.put_json(&Bucket::Utxos, &utxo.key(), utxo)
	}

	/// Look up an output in the global index.
	pub fn get_utxo(&self, txid: &str, output_index: u32) -> Result<Utxo, StoreError> {
		let _guard = self.read()?;
		let key = utxo_key(txid, output_index);
		self.get_json(&Bucket::Utxos, &key)?
			.ok_or(StoreError::NotFound(key))
	}

	/// Merge-write an output into the address namespace and return the stored record.
	///
	/// The incoming record replaces the stored one, except that a recorded spend is kept when
	/// the incoming record carries none. Re-indexing an output after its spend was seen can
	/// therefore never resurrect it.
	pub fn update_address_utxo(&self, address: &str, utxo: Utxo) -> Result<Utxo, StoreError> {
		let _guard = self.write()?;
		let bucket = Bucket::AddressUtxos(address.to_string());
		let key = utxo.key();

		let mut merged = utxo;
		if merged.spent_by.is_empty() {
			if let Some(stored) = self.get_json::<Utxo>(&bucket, &key)? {
				merged.spent_by = stored.spent_by;
			}
		}
		self.put_json(&bucket, &key, &merged)?;
		Ok(merged)
	}

	/// Overwrite an output in the address namespace unconditionally.
	///
	/// This is the only write that can clear a recorded spend.
	pub fn update_address_utxo_mandatory(&self, address: &str, utxo: &Utxo) -> Result<(), StoreError> {
		let _guard = self.write()?;
		self.put_json(&Bucket::AddressUtxos(address.to_string()), &utxo.key(), utxo)
	}

	pub fn get_address_utxo(
		&self,
		address: &str,
		txid: &str,
		output_index: u32,
	) -> Result<Utxo, StoreError> {
		let _guard = self.read()?;
		let key = utxo_key(txid, output_index);
		self.get_json(&Bucket::AddressUtxos(address.to_string()), &key)?
			.ok_or(StoreError::NotFound(key))
	}

	/// Spendable outputs of `address` at `current_height`: unspent, mature and unlocked.
	///
	/// # Arguments
	/// * `address` - Watched address.
	/// * `coin` - Restrict to one coin, or all coins when `None`.
	/// * `current_height` - Height maturity and locks are evaluated against.
	pub fn get_address_utxos(
		&self,
		address: &str,
		coin: Option<&str>,
		current_height: u64,
	) -> Result<UtxoSet, StoreError> {
		let maturity = self.coinbase_maturity();
		Ok(self
			.scan_address(address)?
			.into_iter()
			.filter(|utxo| utxo.matches_coin(coin) && utxo.is_spendable(current_height, maturity))
			.collect())
	}

	/// Spent outputs of `address`.
	pub fn get_address_spent_utxos(
		&self,
		address: &str,
		coin: Option<&str>,
	) -> Result<UtxoSet, StoreError> {
		Ok(self
			.scan_address(address)?
			.into_iter()
			.filter(|utxo| utxo.matches_coin(coin) && !utxo.is_unspent())
			.collect())
	}

	/// Unspent outputs of `address` that are not yet spendable at `current_height`, either
	/// immature coinbase outputs or outputs still under a lock height.
	pub fn get_address_lock_utxos(
		&self,
		address: &str,
		coin: Option<&str>,
		current_height: u64,
	) -> Result<UtxoSet, StoreError> {
		let maturity = self.coinbase_maturity();
		Ok(self
			.scan_address(address)?
			.into_iter()
			.filter(|utxo| {
				utxo.matches_coin(coin)
					&& utxo.is_unspent()
					&& !utxo.is_spendable(current_height, maturity)
			})
			.collect())
	}

	/// Sum of unspent amounts over all watched addresses, ignoring maturity and locks.
	pub fn sum_unspent(&self, coin: Option<&str>) -> Result<u64, StoreError> {
		let mut total = 0u64;
		for address in self.list_addresses()? {
			total = self
				.scan_address(&address)?
				.iter()
				.filter(|utxo| utxo.matches_coin(coin) && utxo.is_unspent())
				.fold(total, |acc, utxo| acc.saturating_add(utxo.amount));
		}
		Ok(total)
	}

	fn scan_address(&self, address: &str) -> Result<Vec<Utxo>, StoreError> {
		let _guard = self.read()?;
		self.scan_json(&Bucket::AddressUtxos(address.to_string()))
	}

	// Spent ledger

	/// Record a ledger entry, replacing any previous entry for the same spending txid.
	pub fn insert_spent_utxo(&self, entry: &SpentLedgerEntry) -> Result<(), StoreError> {
		let _guard = self.write()?;
		self.put_json(&Bucket::SpentLedger, &entry.spending_txid, entry)
	}

	pub fn get_spent_utxo(&self, spending_txid: &str) -> Result<Option<SpentLedgerEntry>, StoreError> {
		let _guard = self.read()?;
		self.get_json(&Bucket::SpentLedger, spending_txid)
	}

	/// Remove a ledger entry. Removing an absent entry is a no-op.
	pub fn delete_spent_utxo(&self, spending_txid: &str) -> Result<(), StoreError> {
		let _guard = self.write()?;
		self.backend
			.delete(&Bucket::SpentLedger, spending_txid.as_bytes())
	}

	pub fn list_spent_ledger(&self) -> Result<Vec<SpentLedgerEntry>, StoreError> {
		let _guard = self.read()?;
		self.scan_json(&Bucket::SpentLedger)
	}

	// Cursors

	/// Next block order of the transaction stream; 0 when never written.
	pub fn get_cursor(&self) -> Result<u64, StoreError> {
		self.get_u64(TX_CURSOR_KEY)
	}

	pub fn update_cursor(&self, order: u64) -> Result<(), StoreError> {
		self.put_u64(TX_CURSOR_KEY, order)
	}

	pub fn get_coinbase_cursor(&self) -> Result<u64, StoreError> {
		self.get_u64(COINBASE_CURSOR_KEY)
	}

	pub fn update_coinbase_cursor(&self, order: u64) -> Result<(), StoreError> {
		self.put_u64(COINBASE_CURSOR_KEY, order)
	}

	/// Highest block height seen by the indexer.
	pub fn get_height(&self) -> Result<u64, StoreError> {
		self.get_u64(HEIGHT_KEY)
	}

	pub fn update_height(&self, height: u64) -> Result<(), StoreError> {
		self.put_u64(HEIGHT_KEY, height)
	}

	pub fn flush(&self) -> Result<(), StoreError> {
		let _guard = self.write()?;
		self.backend.flush()
	}

	// Encoding helpers. Callers hold the lock.

	fn get_json<T: DeserializeOwned>(&self, bucket: &Bucket, key: &str) -> Result<Option<T>, StoreError> {
		match self.backend.get(bucket, key.as_bytes())? {
			Some(bytes) => serde_json::from_slice(&bytes)
				.map(Some)
				.map_err(|source| StoreError::Decode {
					bucket: bucket.name().into_owned(),
					key: key.to_string(),
					source,
				}),
			None => Ok(None),
		}
	}

	fn put_json<T: Serialize>(&self, bucket: &Bucket, key: &str, value: &T) -> Result<(), StoreError> {
		let bytes = serde_json::to_vec(value).map_err(StoreError::Encode)?;
		self.backend.put(bucket, key.as_bytes(), &bytes)
	}

	fn scan_json<T: DeserializeOwned>(&self, bucket: &Bucket) -> Result<Vec<T>, StoreError> {
		let mut records = Vec::new();
		for (key, value) in self.backend.scan(bucket)? {
			match serde_json::from_slice(&value) {
				Ok(record) => records.push(record),
				Err(e) => warn!(
					"Skipping undecodable record {} in {}: {}",
					String::from_utf8_lossy(&key),
					bucket.name(),
					e
				),
			}
		}
		Ok(records)
	}

	fn get_u64(&self, key: &[u8]) -> Result<u64, StoreError> {
		let _guard = self.read()?;
		match self.backend.get(&Bucket::Meta, key)? {
			None => Ok(0),
			Some(bytes) => {
				let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
					StoreError::CorruptCursor(String::from_utf8_lossy(key).into_owned())
				})?;
				Ok(u64::from_be_bytes(bytes))
			}
		}
	}

	fn put_u64(&self, key: &[u8], value: u64) -> Result<(), StoreError> {
		let _guard = self.write()?;
		self.backend.put(&Bucket::Meta, key, &value.to_be_bytes())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::backend::FlakyBackend;
	use std::sync::Arc;

	fn output(txid: &str, index: u32, address: &str, amount: u64) -> Utxo {
		Utxo {
			txid: txid.to_string(),
			output_index: index,
			address: address.to_string(),
			coin: "MEER".to_string(),
			amount,
			created_height: 10,
			..Utxo::default()
		}
	}

	#[test]
	fn test_merge_write_keeps_recorded_spend() {
		let store = UtxoStore::in_memory().expect("store");
		let mut spent = output("t1", 0, "TmA", 100);
		spent.spent_by = "abc".to_string();
		store.update_address_utxo("TmA", spent).expect("spend");

		// Replayed block indexes the same output again without a spend.
		let merged = store
			.update_address_utxo("TmA", output("t1", 0, "TmA", 100))
			.expect("replay");
		assert_eq!(merged.spent_by, "abc");

		let stored = store.get_address_utxo("TmA", "t1", 0).expect("get");
		assert_eq!(stored.spent_by, "abc");
		assert!(store.get_address_utxos("TmA", None, 1000).expect("utxos").utxos.is_empty());
	}

	#[test]
	fn test_mandatory_write_clears_spend() {
		let store = UtxoStore::in_memory().expect("store");
		let mut spent = output("t1", 0, "TmA", 100);
		spent.spent_by = "abc".to_string();
		store.update_address_utxo("TmA", spent).expect("spend");

		store
			.update_address_utxo_mandatory("TmA", &output("t1", 0, "TmA", 100))
			.expect("revert");
		let set = store.get_address_utxos("TmA", None, 1000).expect("utxos");
		assert_eq!(set.total, 100);
		assert_eq!(set.utxos.len(), 1);
	}

	#[test]
	fn test_coinbase_maturity_evaluated_at_read_time() {
		let store = UtxoStore::in_memory().expect("store");
		store.set_coinbase_maturity(720);
		let mut reward = output("cb", 0, "TmA", 5000);
		reward.is_coinbase = true;
		reward.created_height = 100;
		store.update_address_utxo("TmA", reward).expect("write");

		assert_eq!(store.get_address_utxos("TmA", None, 819).expect("read").total, 0);
		assert_eq!(store.get_address_lock_utxos("TmA", None, 819).expect("read").total, 5000);
		assert_eq!(store.get_address_utxos("TmA", None, 820).expect("read").total, 5000);
		assert_eq!(store.get_address_lock_utxos("TmA", None, 820).expect("read").total, 0);
	}

	#[test]
	fn test_coin_filter_and_spent_listing() {
		let store = UtxoStore::in_memory().expect("store");
		store.insert_address("TmA").expect("address");
		store.update_address_utxo("TmA", output("t1", 0, "TmA", 100)).expect("write");
		let mut other = output("t1", 1, "TmA", 7);
		other.coin = "QIT".to_string();
		store.update_address_utxo("TmA", other).expect("write");
		let mut spent = output("t0", 0, "TmA", 40);
		spent.spent_by = "t1".to_string();
		store.update_address_utxo("TmA", spent).expect("write");

		assert_eq!(store.get_address_utxos("TmA", Some("MEER"), 50).expect("read").total, 100);
		assert_eq!(store.get_address_utxos("TmA", None, 50).expect("read").total, 107);
		assert_eq!(store.get_address_spent_utxos("TmA", None).expect("read").total, 40);
		assert_eq!(store.sum_unspent(None).expect("sum"), 107);
		assert_eq!(store.sum_unspent(Some("QIT")).expect("sum"), 7);
	}

	#[test]
	fn test_corrupt_record_point_lookup_fails_scan_skips() {
		let backend = std::sync::Arc::new(MemoryBackend::new());
		let store = UtxoStore::open(backend.clone()).expect("store");
		store.update_address_utxo("TmA", output("t1", 0, "TmA", 100)).expect("write");
		backend
			.put(&Bucket::AddressUtxos("TmA".into()), b"t2-0", b"{not json")
			.expect("corrupt");

		let err = store.get_address_utxo("TmA", "t2", 0).expect_err("decode error");
		assert!(matches!(err, StoreError::Decode { .. }));

		let set = store.get_address_utxos("TmA", None, 50).expect("scan");
		assert_eq!(set.utxos.len(), 1);
		assert_eq!(set.total, 100);
	}

	#[test]
	fn test_missing_records() {
		let store = UtxoStore::in_memory().expect("store");
		assert!(matches!(store.get_utxo("t9", 0), Err(StoreError::NotFound(_))));
		assert!(store.get_address_utxos("TmZ", None, 0).expect("read").utxos.is_empty());
		assert_eq!(store.get_cursor().expect("cursor"), 0);
		assert!(store.get_spent_utxo("abc").expect("ledger").is_none());
		store.delete_spent_utxo("abc").expect("delete absent");
	}

	#[test]
	fn test_registry_and_cursors_persist_across_reopen() {
		let dir = tempfile::tempdir().expect("tempdir");
		{
			let store = UtxoStore::open_sled(dir.path()).expect("store");
			store.insert_address("TmB").expect("address");
			store.insert_address("TmA").expect("address");
			store.insert_address("TmA").expect("duplicate address");
			store.update_cursor(101).expect("cursor");
			store.update_coinbase_cursor(55).expect("cursor");
			store.update_height(90).expect("height");
			store
				.insert_spent_utxo(&SpentLedgerEntry::new("abc", vec![output("t1", 0, "TmA", 1)]))
				.expect("ledger");
			store.flush().expect("flush");
		}

		let store = UtxoStore::open_sled(dir.path()).expect("reopen");
		assert_eq!(store.list_addresses().expect("list"), vec!["TmA", "TmB"]);
		assert!(store.address_exists("TmA").expect("exists"));
		assert!(!store.address_exists("TmC").expect("exists"));
		assert_eq!(store.get_cursor().expect("cursor"), 101);
		assert_eq!(store.get_coinbase_cursor().expect("cursor"), 55);
		assert_eq!(store.get_height().expect("height"), 90);
		assert_eq!(store.list_spent_ledger().expect("ledger").len(), 1);
	}

	#[test]
	fn test_corrupt_cursor_is_reported() {
		let backend = std::sync::Arc::new(MemoryBackend::new());
		let store = UtxoStore::open(backend.clone()).expect("store");
		backend.put(&Bucket::Meta, TX_CURSOR_KEY, b"xyz").expect("corrupt");
		assert!(matches!(store.get_cursor(), Err(StoreError::CorruptCursor(_))));
	}

	#[test]
	fn test_failed_registry_write_leaves_mirror_untouched() {
		let backend = Arc::new(FlakyBackend::new());
		let store = UtxoStore::open(backend.clone()).expect("store");

		backend.fail_next_puts(1);
		assert!(matches!(store.insert_address("TmA"), Err(StoreError::Backend(_))));
		assert!(!store.address_exists("TmA").expect("exists"));
		assert!(store.list_addresses().expect("list").is_empty());

		store.insert_address("TmA").expect("address");
		assert!(store.address_exists("TmA").expect("exists"));
		let reopened = UtxoStore::open(backend).expect("reopen");
		assert_eq!(reopened.list_addresses().expect("list"), vec!["TmA".to_string()]);
	}
}
