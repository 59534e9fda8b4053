//! Cross-process named counters.
//!
//! A [`SharedCounters`] store is a POSIX shared-memory segment holding one
//! process-shared mutex and a fixed table of named slots. The supervisor
//! creates it before forking, workers use the inherited mapping, and control
//! commands attach to it by key.
//!
//! ```text
//! +-------+-----------------+------------------------------------+
//! | magic | pthread_mutex_t | slot[0] .. slot[MAX_SLOTS - 1]      |
//! +-------+-----------------+------------------------------------+
//!                            slot = tag | name_len | name | value
//! ```
//!
//! Every single-slot operation takes the mutex. [`SharedCounters::transaction`]
//! takes it once for a whole read-modify-write; the [`Transaction`] it hands
//! out reads and writes without locking again.

use crate::error::{StoreError, StoreResult};
use serde::Serialize;
use std::ffi::CString;
use std::io;
use std::mem::{self, ManuallyDrop};
use std::ptr::{self, NonNull};
use tracing::warn;

const MAGIC: u64 = 0x4554_5544_4543_4e54;

pub const MAX_SLOTS: usize = 64;
pub const MAX_NAME_LEN: usize = 46;

const TAG_EMPTY: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_BOOL: u8 = 3;

#[repr(C)]
#[derive(Clone, Copy)]
struct Slot {
    tag: u8,
    len: u8,
    name: [u8; MAX_NAME_LEN],
    bits: u64,
}

impl Slot {
    const EMPTY: Slot = Slot {
        tag: TAG_EMPTY,
        len: 0,
        name: [0; MAX_NAME_LEN],
        bits: 0,
    };

    fn is(&self, name: &[u8]) -> bool {
        self.tag != TAG_EMPTY && &self.name[..self.len as usize] == name
    }

    fn value(&self) -> Option<Value> {
        match self.tag {
            TAG_INT => Some(Value::Int(self.bits as i64)),
            TAG_FLOAT => Some(Value::Float(f64::from_bits(self.bits))),
            TAG_BOOL => Some(Value::Bool(self.bits != 0)),
            _ => None,
        }
    }
}

#[repr(C)]
struct Segment {
    magic: u64,
    mutex: libc::pthread_mutex_t,
    slots: [Slot; MAX_SLOTS],
}

/// A value held in a counter slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn encode(self) -> (u8, u64) {
        match self {
            Value::Int(v) => (TAG_INT, v as u64),
            Value::Float(v) => (TAG_FLOAT, v.to_bits()),
            Value::Bool(v) => (TAG_BOOL, v as u64),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Handle on a mapped counter segment.
///
/// Dropping the handle unmaps the segment; only [`SharedCounters::remove`]
/// destroys it.
pub struct SharedCounters {
    seg: NonNull<Segment>,
    name: Option<CString>,
}

// SAFETY: all access to the mapped table goes through the process-shared
// mutex, which also serialises threads of one process.
unsafe impl Send for SharedCounters {}
unsafe impl Sync for SharedCounters {}

impl SharedCounters {
    /// Create (or reopen) the segment named by `key`.
    pub fn create(key: &str) -> StoreResult<Self> {
        let name = shm_name(key);
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if unsafe { libc::ftruncate(fd, mem::size_of::<Segment>() as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err.into());
        }

        let seg = map(fd)?;
        let store = Self {
            seg,
            name: Some(name),
        };
        if unsafe { ptr::read_volatile(&raw const (*store.seg.as_ptr()).magic) } != MAGIC {
            store.initialize()?;
        }
        Ok(store)
    }

    /// Attach to a segment created by [`SharedCounters::create`]. Never creates.
    pub fn attach(key: &str) -> StoreResult<Self> {
        let name = shm_name(key);
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut stat: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } < 0
            || (stat.st_size as usize) < mem::size_of::<Segment>()
        {
            unsafe { libc::close(fd) };
            return Err(StoreError::NotInitialized);
        }

        let seg = map(fd)?;
        let store = Self {
            seg,
            name: Some(name),
        };
        if unsafe { ptr::read_volatile(&raw const (*store.seg.as_ptr()).magic) } != MAGIC {
            return Err(StoreError::NotInitialized);
        }
        Ok(store)
    }

    /// A nameless segment shared only with processes forked after creation.
    pub fn anonymous() -> StoreResult<Self> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mem::size_of::<Segment>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let seg = NonNull::new(addr as *mut Segment).ok_or(StoreError::NotInitialized)?;
        let store = Self { seg, name: None };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> StoreResult<()> {
        let seg = self.seg.as_ptr();
        unsafe {
            ptr::write(&raw mut (*seg).slots, [Slot::EMPTY; MAX_SLOTS]);

            let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut attr))?;
            check(libc::pthread_mutexattr_setpshared(
                &mut attr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            // Relocking from inside a transaction fails with EDEADLK.
            check(libc::pthread_mutexattr_settype(
                &mut attr,
                libc::PTHREAD_MUTEX_ERRORCHECK,
            ))?;
            #[cfg(target_os = "linux")]
            check(libc::pthread_mutexattr_setrobust(
                &mut attr,
                libc::PTHREAD_MUTEX_ROBUST,
            ))?;
            let rc = libc::pthread_mutex_init(&raw mut (*seg).mutex, &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            check(rc)?;

            ptr::write_volatile(&raw mut (*seg).magic, MAGIC);
        }
        Ok(())
    }

    fn lock(&self) -> StoreResult<Transaction<'_>> {
        let mutex = unsafe { &raw mut (*self.seg.as_ptr()).mutex };
        match unsafe { libc::pthread_mutex_lock(mutex) } {
            0 => {}
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                warn!("previous holder of the counter lock died, recovering");
                unsafe { libc::pthread_mutex_consistent(mutex) };
            }
            rc => return Err(StoreError::Lock(rc)),
        }
        Ok(Transaction { store: self })
    }

    /// Read one value. Lock failures are indistinguishable from an unset name.
    pub fn get(&self, name: &str) -> Option<Value> {
        match self.lock() {
            Ok(tx) => tx.get(name),
            Err(err) => {
                warn!(name, %err, "counter read failed");
                None
            }
        }
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> StoreResult<()> {
        self.lock()?.set(name, value)
    }

    pub fn unset(&self, name: &str) -> StoreResult<()> {
        self.lock()?.unset(name);
        Ok(())
    }

    /// Run `f` with the lock held once.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> StoreResult<R> {
        let mut tx = self.lock()?;
        Ok(f(&mut tx))
    }

    /// Add `by` to an integer slot and return the new value.
    ///
    /// Unset or non-integer slots are left untouched and yield
    /// [`StoreError::NotInteger`].
    pub fn increment(&self, name: &str, by: i64) -> StoreResult<i64> {
        self.transaction(|tx| match tx.get(name) {
            Some(Value::Int(v)) => {
                let next = v.wrapping_add(by);
                tx.set(name, next)?;
                Ok(next)
            }
            _ => Err(StoreError::NotInteger),
        })?
    }

    pub fn decrement(&self, name: &str, by: i64) -> StoreResult<i64> {
        self.increment(name, by.wrapping_neg())
    }

    /// Every set slot, in table order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        let Ok(tx) = self.lock() else {
            return Vec::new();
        };
        tx.slots()
            .iter()
            .filter_map(|slot| {
                let value = slot.value()?;
                let name = String::from_utf8_lossy(&slot.name[..slot.len as usize]).into_owned();
                Some((name, value))
            })
            .collect()
    }

    /// Destroy the mutex, unmap and unlink the segment.
    ///
    /// Call once, after every other process has detached.
    pub fn remove(self) -> StoreResult<()> {
        let this = ManuallyDrop::new(self);
        let seg = this.seg.as_ptr();
        unsafe {
            ptr::write_volatile(&raw mut (*seg).magic, 0);
            libc::pthread_mutex_destroy(&raw mut (*seg).mutex);
            libc::munmap(seg as *mut libc::c_void, mem::size_of::<Segment>());
        }
        if let Some(name) = &this.name {
            if unsafe { libc::shm_unlink(name.as_ptr()) } < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }
}

impl Drop for SharedCounters {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(
                self.seg.as_ptr() as *mut libc::c_void,
                mem::size_of::<Segment>(),
            );
        }
    }
}

/// Locked view of the store. Unlocks when dropped.
pub struct Transaction<'a> {
    store: &'a SharedCounters,
}

impl Transaction<'_> {
    fn slots(&self) -> &[Slot; MAX_SLOTS] {
        // SAFETY: the lock is held for the lifetime of `self`.
        unsafe { &*(&raw const (*self.store.seg.as_ptr()).slots) }
    }

    fn slots_mut(&mut self) -> &mut [Slot; MAX_SLOTS] {
        // SAFETY: as above; `&mut self` keeps this the only live view.
        unsafe { &mut *(&raw mut (*self.store.seg.as_ptr()).slots) }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let name = name.as_bytes();
        self.slots().iter().find(|s| s.is(name))?.value()
    }

    /// Store `value`. Fails without touching the table when the name is too
    /// long or no slot is free.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> StoreResult<()> {
        let bytes = name.as_bytes();
        if bytes.len() > MAX_NAME_LEN {
            return Err(StoreError::KeyTooLong(MAX_NAME_LEN));
        }
        let (tag, bits) = value.into().encode();
        let slots = self.slots_mut();

        let idx = match slots.iter().position(|s| s.is(bytes)) {
            Some(idx) => idx,
            None => slots
                .iter()
                .position(|s| s.tag == TAG_EMPTY)
                .ok_or(StoreError::Full)?,
        };
        let slot = &mut slots[idx];
        slot.name[..bytes.len()].copy_from_slice(bytes);
        slot.len = bytes.len() as u8;
        slot.bits = bits;
        slot.tag = tag;
        Ok(())
    }

    pub fn unset(&mut self, name: &str) {
        let name = name.as_bytes();
        if let Some(slot) = self.slots_mut().iter_mut().find(|s| s.is(name)) {
            *slot = Slot::EMPTY;
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(&raw mut (*self.store.seg.as_ptr()).mutex);
        }
    }
}

fn map(fd: libc::c_int) -> StoreResult<NonNull<Segment>> {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            mem::size_of::<Segment>(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if addr == libc::MAP_FAILED {
        return Err(err.into());
    }
    NonNull::new(addr as *mut Segment).ok_or(StoreError::NotInitialized)
}

fn check(rc: libc::c_int) -> StoreResult<()> {
    if rc != 0 {
        return Err(StoreError::Lock(rc));
    }
    Ok(())
}

/// `/etude.<key>` with anything outside `[A-Za-z0-9._-]` replaced by `_`.
fn shm_name(key: &str) -> CString {
    let mut name = String::with_capacity(key.len() + 7);
    name.push_str("/etude.");
    name.extend(key.chars().take(200).map(|c| {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            c
        } else {
            '_'
        }
    }));
    // No interior NUL survives the mapping above.
    CString::new(name).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_key(tag: &str) -> String {
        format!("test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_get_unset_is_none() {
        let store = SharedCounters::anonymous().unwrap();
        assert_eq!(store.get("workers"), None);
    }

    #[test]
    fn test_set_and_get_each_kind() {
        let store = SharedCounters::anonymous().unwrap();
        store.set("pid", 42i64).unwrap();
        store.set("ratio", 0.5f64).unwrap();
        store.set("writing", true).unwrap();
        assert_eq!(store.get("pid"), Some(Value::Int(42)));
        assert_eq!(store.get("ratio"), Some(Value::Float(0.5)));
        assert_eq!(store.get("writing"), Some(Value::Bool(true)));
    }

    #[test]
    fn test_increment_and_decrement() {
        let store = SharedCounters::anonymous().unwrap();
        store.set("total_connections", 0i64).unwrap();
        assert_eq!(store.increment("total_connections", 5).unwrap(), 5);
        assert_eq!(store.decrement("total_connections", 2).unwrap(), 3);
    }

    #[test]
    fn test_increment_non_integer_fails_without_mutation() {
        let store = SharedCounters::anonymous().unwrap();
        store.set("flag", true).unwrap();
        assert!(matches!(store.increment("flag", 1), Err(StoreError::NotInteger)));
        assert_eq!(store.get("flag"), Some(Value::Bool(true)));

        assert!(matches!(store.increment("missing", 1), Err(StoreError::NotInteger)));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn test_transaction_reads_and_writes_under_one_lock() {
        let store = SharedCounters::anonymous().unwrap();
        store.set("a", 1i64).unwrap();
        let sum = store
            .transaction(|tx| {
                let a = tx.get("a").and_then(|v| v.as_int()).unwrap_or(0);
                tx.set("b", a + 1).unwrap();
                a + tx.get("b").and_then(|v| v.as_int()).unwrap_or(0)
            })
            .unwrap();
        assert_eq!(sum, 3);
        assert_eq!(store.get("b"), Some(Value::Int(2)));
    }

    #[test]
    fn test_nested_access_inside_transaction_fails_instead_of_hanging() {
        let store = SharedCounters::anonymous().unwrap();
        store.set("a", 1i64).unwrap();
        let (read, write) = store
            .transaction(|_tx| (store.get("a"), store.set("a", 5i64)))
            .unwrap();
        assert_eq!(read, None);
        assert!(matches!(write, Err(StoreError::Lock(libc::EDEADLK))));

        assert_eq!(store.get("a"), Some(Value::Int(1)));
        assert_eq!(store.increment("a", 1).unwrap(), 2);
    }

    #[test]
    fn test_name_too_long_is_rejected() {
        let store = SharedCounters::anonymous().unwrap();
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(store.set(&long, 1i64), Err(StoreError::KeyTooLong(_))));
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_table_full() {
        let store = SharedCounters::anonymous().unwrap();
        for i in 0..MAX_SLOTS {
            store.set(&format!("c{i}"), i as i64).unwrap();
        }
        assert!(matches!(store.set("one-more", 1i64), Err(StoreError::Full)));
        // Overwriting an existing name still works.
        store.set("c0", 99i64).unwrap();
        assert_eq!(store.get("c0"), Some(Value::Int(99)));
    }

    #[test]
    fn test_unset_frees_slot() {
        let store = SharedCounters::anonymous().unwrap();
        store.set("pid", 1i64).unwrap();
        store.unset("pid").unwrap();
        assert_eq!(store.get("pid"), None);
    }

    #[test]
    fn test_named_segment_attach_and_remove() {
        let key = unique_key("attach");
        let owner = SharedCounters::create(&key).unwrap();
        owner.set("workers", 4i64).unwrap();

        let other = SharedCounters::attach(&key).unwrap();
        assert_eq!(other.get("workers"), Some(Value::Int(4)));
        other.increment("workers", 1).unwrap();
        assert_eq!(owner.get("workers"), Some(Value::Int(5)));
        drop(other);

        owner.remove().unwrap();
        assert!(SharedCounters::attach(&key).is_err());
    }

    #[test]
    fn test_attach_never_creates() {
        let key = unique_key("never-created");
        assert!(SharedCounters::attach(&key).is_err());
    }

    #[test]
    fn test_shm_name_is_sanitised() {
        let name = shm_name("http://127.0.0.1:8080");
        assert_eq!(name.to_str().unwrap(), "/etude.http___127.0.0.1_8080");
    }
}
