//! Persistent device identity.
//!
//! A small versioned record kept in byte-addressable non-volatile memory
//! (EEPROM, or a RAM-cached flash sector). The byte offsets below are a
//! compatibility contract; changing them requires bumping [`LAYOUT_VERSION`],
//! after which older records are reset to defaults on the next boot.
//!
//! ```text
//! 0x00  magic      B5 7A
//! 0x02  version    01
//! 0x03  reserved
//! 0x04  unit id    u16 LE
//! 0x06  serial     u32 LE
//! 0x0A  alias len  u16 LE
//! 0x0C  alias      64 bytes
//! ```

use heapless::Vec;

pub const MAGIC: [u8; 2] = [0xB5, 0x7A];
pub const LAYOUT_VERSION: u8 = 0x01;

const OFFSET_MAGIC: usize = 0x00;
const OFFSET_VERSION: usize = 0x02;
const OFFSET_UNIT_ID: usize = 0x04;
const OFFSET_SERIAL: usize = 0x06;
const OFFSET_ALIAS_LEN: usize = 0x0A;
const OFFSET_ALIAS: usize = 0x0C;

/// Longest alias kept; longer ones are truncated.
pub const MAX_ALIAS_LEN: usize = 64;

/// Bytes occupied by the record.
pub const RECORD_LEN: usize = OFFSET_ALIAS + MAX_ALIAS_LEN;

/// Alias reported while none has been stored.
pub const FALLBACK_ALIAS: &[u8] = b"sensor-node";

/// Stored alias bytes.
pub type Alias = Vec<u8, MAX_ALIAS_LEN>;

/// Byte-addressable non-volatile memory.
pub trait ByteStore {
    type Error: core::fmt::Debug;

    fn capacity(&self) -> usize;

    fn read(&mut self, offset: usize) -> Result<u8, Self::Error>;

    fn write(&mut self, offset: usize, byte: u8) -> Result<(), Self::Error>;

    /// Make previous writes durable. EEPROM-like stores need nothing here.
    fn commit(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Error type for persistent store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError<E> {
    /// Backing memory smaller than the record.
    TooSmall,
    /// Backing memory failed.
    Io(E),
}

impl<E: core::fmt::Debug> core::fmt::Display for StoreError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooSmall => write!(f, "store smaller than record"),
            Self::Io(e) => write!(f, "store I/O error: {:?}", e),
        }
    }
}

/// Result of validating the record at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreStatus {
    /// Header matched; contents kept.
    Valid,
    /// Header absent or unrecognized; defaults written.
    Reinitialized,
}

/// Typed access to the identity record.
pub struct PersistentStore<S> {
    store: S,
}

impl<S: ByteStore> PersistentStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Validate magic and version; reset the record to defaults if either
    /// does not match. A recognized record is never touched.
    pub fn begin(&mut self) -> Result<StoreStatus, StoreError<S::Error>> {
        if self.store.capacity() < RECORD_LEN {
            return Err(StoreError::TooSmall);
        }
        let magic = [self.read_u8(OFFSET_MAGIC)?, self.read_u8(OFFSET_MAGIC + 1)?];
        let version = self.read_u8(OFFSET_VERSION)?;
        if magic == MAGIC && version == LAYOUT_VERSION {
            return Ok(StoreStatus::Valid);
        }

        warn!("identity record invalid, writing defaults");
        // fields first, header last: an interrupted reset stays invalid
        self.update_bytes(OFFSET_UNIT_ID, &0u16.to_le_bytes())?;
        self.update_bytes(OFFSET_SERIAL, &0u32.to_le_bytes())?;
        self.update_bytes(OFFSET_ALIAS_LEN, &0u16.to_le_bytes())?;
        for i in 0..MAX_ALIAS_LEN {
            self.update(OFFSET_ALIAS + i, 0)?;
        }
        self.store.commit().map_err(StoreError::Io)?;
        self.update(OFFSET_VERSION, LAYOUT_VERSION)?;
        self.update_bytes(OFFSET_MAGIC, &MAGIC)?;
        self.store.commit().map_err(StoreError::Io)?;
        Ok(StoreStatus::Reinitialized)
    }

    /// Stored unit address; 0 when unset.
    pub fn unit_id(&mut self) -> Result<u16, StoreError<S::Error>> {
        let mut bytes = [0u8; 2];
        self.read_bytes(OFFSET_UNIT_ID, &mut bytes)?;
        Ok(u16::from_le_bytes(bytes))
    }

    pub fn set_unit_id(&mut self, unit_id: u16) -> Result<(), StoreError<S::Error>> {
        self.update_bytes(OFFSET_UNIT_ID, &unit_id.to_le_bytes())?;
        self.store.commit().map_err(StoreError::Io)
    }

    pub fn serial(&mut self) -> Result<u32, StoreError<S::Error>> {
        let mut bytes = [0u8; 4];
        self.read_bytes(OFFSET_SERIAL, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn set_serial(&mut self, serial: u32) -> Result<(), StoreError<S::Error>> {
        self.update_bytes(OFFSET_SERIAL, &serial.to_le_bytes())?;
        self.store.commit().map_err(StoreError::Io)
    }

    /// Stored alias, or [`FALLBACK_ALIAS`] when none has been stored.
    pub fn alias(&mut self) -> Result<Alias, StoreError<S::Error>> {
        let mut len_bytes = [0u8; 2];
        self.read_bytes(OFFSET_ALIAS_LEN, &mut len_bytes)?;
        let len = usize::from(u16::from_le_bytes(len_bytes)).min(MAX_ALIAS_LEN);

        let mut alias = Alias::new();
        if len == 0 {
            // FALLBACK_ALIAS is shorter than MAX_ALIAS_LEN
            let _ = alias.extend_from_slice(FALLBACK_ALIAS);
            return Ok(alias);
        }
        for i in 0..len {
            let byte = self.read_u8(OFFSET_ALIAS + i)?;
            let _ = alias.push(byte);
        }
        Ok(alias)
    }

    /// Store an alias, truncated to [`MAX_ALIAS_LEN`] bytes. Unused alias
    /// bytes are zeroed.
    pub fn set_alias(&mut self, alias: &[u8]) -> Result<(), StoreError<S::Error>> {
        let alias = &alias[..alias.len().min(MAX_ALIAS_LEN)];
        self.update_bytes(OFFSET_ALIAS_LEN, &(alias.len() as u16).to_le_bytes())?;
        for i in 0..MAX_ALIAS_LEN {
            self.update(OFFSET_ALIAS + i, alias.get(i).copied().unwrap_or(0))?;
        }
        self.store.commit().map_err(StoreError::Io)
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    fn read_u8(&mut self, offset: usize) -> Result<u8, StoreError<S::Error>> {
        self.store.read(offset).map_err(StoreError::Io)
    }

    fn read_bytes(&mut self, offset: usize, out: &mut [u8]) -> Result<(), StoreError<S::Error>> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read_u8(offset + i)?;
        }
        Ok(())
    }

    /// Write a byte only if it differs from what is stored.
    fn update(&mut self, offset: usize, byte: u8) -> Result<(), StoreError<S::Error>> {
        if self.read_u8(offset)? != byte {
            self.store.write(offset, byte).map_err(StoreError::Io)?;
        }
        Ok(())
    }

    fn update_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<(), StoreError<S::Error>> {
        for (i, &byte) in bytes.iter().enumerate() {
            self.update(offset + i, byte)?;
        }
        Ok(())
    }
}

/// Out-of-range access on a [`RamStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OutOfBounds;

/// Byte store in RAM, erased to 0xFF. Counts physical writes.
pub struct RamStore<const N: usize> {
    cells: [u8; N],
    writes: usize,
}

impl<const N: usize> RamStore<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cells: [0xFF; N],
            writes: 0,
        }
    }

    /// Number of bytes physically written so far.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.cells
    }
}

impl<const N: usize> Default for RamStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ByteStore for RamStore<N> {
    type Error = OutOfBounds;

    fn capacity(&self) -> usize {
        N
    }

    fn read(&mut self, offset: usize) -> Result<u8, Self::Error> {
        self.cells.get(offset).copied().ok_or(OutOfBounds)
    }

    fn write(&mut self, offset: usize, byte: u8) -> Result<(), Self::Error> {
        let cell = self.cells.get_mut(offset).ok_or(OutOfBounds)?;
        *cell = byte;
        self.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestStore = PersistentStore<RamStore<128>>;

    fn fresh() -> TestStore {
        let mut store = PersistentStore::new(RamStore::new());
        assert_eq!(store.begin(), Ok(StoreStatus::Reinitialized));
        store
    }

    #[test]
    fn test_blank_memory_is_reinitialized() {
        let mut store = fresh();
        assert_eq!(store.unit_id(), Ok(0));
        assert_eq!(store.serial(), Ok(0));
        let bytes = store.inner().as_bytes();
        assert_eq!(&bytes[..3], &[0xB5, 0x7A, 0x01]);
        assert!(bytes[OFFSET_ALIAS..RECORD_LEN].iter().all(|&b| b == 0));
        // bytes past the record are untouched
        assert!(bytes[RECORD_LEN..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_valid_record_survives_begin() {
        let mut store = fresh();
        store.set_unit_id(16).unwrap();
        store.set_serial(0xDEAD_BEEF).unwrap();
        store.set_alias(b"mast-3").unwrap();

        let mut store = PersistentStore::new(store.into_inner());
        assert_eq!(store.begin(), Ok(StoreStatus::Valid));
        assert_eq!(store.unit_id(), Ok(16));
        assert_eq!(store.serial(), Ok(0xDEAD_BEEF));
        assert_eq!(store.alias().unwrap().as_slice(), b"mast-3");
    }

    #[test]
    fn test_unknown_version_treated_as_missing_header() {
        let mut store = fresh();
        store.set_unit_id(16).unwrap();
        store.inner_mut().write(OFFSET_VERSION, 0x02).unwrap();

        let mut store = PersistentStore::new(store.into_inner());
        assert_eq!(store.begin(), Ok(StoreStatus::Reinitialized));
        assert_eq!(store.unit_id(), Ok(0));
        assert_eq!(store.inner().as_bytes()[OFFSET_VERSION], LAYOUT_VERSION);
    }

    #[test]
    fn test_bad_magic_reinitializes() {
        let mut store = fresh();
        store.set_serial(42).unwrap();
        store.inner_mut().write(OFFSET_MAGIC + 1, 0x00).unwrap();

        let mut store = PersistentStore::new(store.into_inner());
        assert_eq!(store.begin(), Ok(StoreStatus::Reinitialized));
        assert_eq!(store.serial(), Ok(0));
    }

    #[test]
    fn test_interrupted_reinit_is_retried() {
        let mut ram = RamStore::<128>::new();
        // defaults partly written, header never reached
        ram.write(OFFSET_UNIT_ID, 0).unwrap();
        let mut store = PersistentStore::new(ram);
        assert_eq!(store.begin(), Ok(StoreStatus::Reinitialized));
        assert_eq!(store.begin(), Ok(StoreStatus::Valid));
    }

    #[test]
    fn test_fallback_alias_before_any_write() {
        let mut store = fresh();
        let alias = store.alias().unwrap();
        assert_eq!(alias.as_slice(), FALLBACK_ALIAS);
        assert_eq!(alias.len(), FALLBACK_ALIAS.len());
    }

    #[test]
    fn test_long_alias_truncated() {
        let mut store = fresh();
        let long = [b'x'; 70];
        store.set_alias(&long).unwrap();
        let alias = store.alias().unwrap();
        assert_eq!(alias.len(), MAX_ALIAS_LEN);
        assert!(alias.iter().all(|&b| b == b'x'));
        assert_eq!(store.inner().as_bytes()[OFFSET_ALIAS_LEN], 64);
    }

    #[test]
    fn test_shorter_alias_clears_tail() {
        let mut store = fresh();
        store.set_alias(b"weather-station-north").unwrap();
        store.set_alias(b"pier").unwrap();
        assert_eq!(store.alias().unwrap().as_slice(), b"pier");
        let bytes = store.inner().as_bytes();
        assert!(bytes[OFFSET_ALIAS + 4..RECORD_LEN].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unchanged_values_are_not_rewritten() {
        let mut store = fresh();
        store.set_unit_id(16).unwrap();
        let writes = store.inner().writes();
        store.set_unit_id(16).unwrap();
        store.set_alias(b"").unwrap();
        assert_eq!(store.inner().writes(), writes);

        // only the low byte differs
        store.set_unit_id(17).unwrap();
        assert_eq!(store.inner().writes(), writes + 1);
    }

    #[test]
    fn test_valid_begin_writes_nothing() {
        let store = fresh();
        let mut store = PersistentStore::new(store.into_inner());
        let writes = store.inner().writes();
        store.begin().unwrap();
        assert_eq!(store.inner().writes(), writes);
    }

    #[test]
    fn test_store_too_small() {
        let mut store = PersistentStore::new(RamStore::<16>::new());
        assert_eq!(store.begin(), Err(StoreError::TooSmall));
    }
}
