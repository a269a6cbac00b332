//! Key/value dictionaries (`AVDictionary`)
//!
//! libavutil represents a dictionary as an `AVDictionary*` that starts out
//! NULL and is reallocated on every insert, so a wrapper holds a pointer to
//! the *slot* that stores it. Owned dictionaries keep their slot on the heap;
//! borrowed ones point at a field of a parent struct (frame metadata, side
//! data metadata) and write straight through to it.

use std::ffi::{c_char, CString};
use std::ops::BitOr;
use std::ptr;
use std::sync::Arc;

use ffmpeg_next::ffi;
use parking_lot::{Mutex, MutexGuard};

use super::c_string;
use crate::error::{check, Error, Result};
use crate::resource::{self, Dependent, Dependents, Native, Ownership, Resource};

/// `AV_DICT_*` flags accepted by dictionary operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DictFlags(i32);

impl DictFlags {
    pub const NONE: DictFlags = DictFlags(0);
    /// Keys compare case-sensitively
    pub const MATCH_CASE: DictFlags = DictFlags(1);
    /// Match keys that start with the given key
    pub const IGNORE_SUFFIX: DictFlags = DictFlags(2);
    /// Keep an existing value instead of overwriting it
    pub const DONT_OVERWRITE: DictFlags = DictFlags(16);
    /// Append to an existing value
    pub const APPEND: DictFlags = DictFlags(32);
    /// Allow several entries with the same key
    pub const MULTIKEY: DictFlags = DictFlags(64);

    const KNOWN: i32 = 1 | 2 | 16 | 32 | 64;

    /// Keep only known flags. The `DONT_STRDUP_*` bits are dropped since they
    /// would hand libavutil memory it did not allocate.
    pub fn from_bits_truncate(bits: i32) -> DictFlags {
        DictFlags(bits & Self::KNOWN)
    }

    pub fn bits(self) -> i32 {
        self.0
    }

    pub fn contains(self, other: DictFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DictFlags {
    type Output = DictFlags;

    fn bitor(self, rhs: DictFlags) -> DictFlags {
        DictFlags(self.0 | rhs.0)
    }
}

type Slot = *mut ffi::AVDictionary;

/// Matches every key together with `IGNORE_SUFFIX`
const EMPTY_KEY: &[u8] = b"\0";

/// Wrapper around an `AVDictionary*` slot
pub struct Dictionary {
    slot: Mutex<Native<Slot>>,
    entries: Dependents,
}

/// A key/value pair read from a dictionary.
///
/// Entries are borrowed views: the dictionary owns the storage, and `free`
/// does nothing. Key and value are copied out when the entry is read. The
/// entry stays usable as the `prev` cursor for [`Dictionary::get`] until the
/// dictionary is next modified.
pub struct DictionaryEntry {
    key: String,
    value: String,
    handle: Mutex<Native<ffi::AVDictionaryEntry>>,
    owner: usize,
}

fn to_c_string(s: &str, what: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::InvalidArgument(format!("{} contains a NUL byte", what)))
}

impl Dictionary {
    /// An empty owned dictionary
    pub fn new() -> Result<Arc<Dictionary>> {
        let slot = Box::into_raw(Box::new(ptr::null_mut::<ffi::AVDictionary>()));
        resource::wrap(slot as usize, Ownership::Owned, || Dictionary {
            slot: Mutex::new(Native::new(slot, Ownership::Owned)),
            entries: Dependents::default(),
        })
    }

    /// Borrowed view of a dictionary slot inside a parent struct
    pub(crate) fn view(slot: *mut Slot) -> Result<Arc<Dictionary>> {
        resource::wrap(slot as usize, Ownership::Borrowed, || Dictionary {
            slot: Mutex::new(Native::new(slot, Ownership::Borrowed)),
            entries: Dependents::default(),
        })
    }

    fn lock(&self) -> Result<(MutexGuard<'_, Native<Slot>>, *mut Slot)> {
        let guard = self.slot.lock();
        let slot = guard.get(Self::KIND)?;
        Ok((guard, slot))
    }

    /// Find the next entry matching `key` after `prev`
    pub fn get(
        &self,
        key: &str,
        prev: Option<&DictionaryEntry>,
        flags: DictFlags,
    ) -> Result<Option<Arc<DictionaryEntry>>> {
        let key = to_c_string(key, "dictionary key")?;
        let (_guard, slot) = self.lock()?;
        let prev = match prev {
            Some(entry) => entry.cursor(slot as usize)?,
            None => ptr::null_mut(),
        };
        let found = unsafe { ffi::av_dict_get(*slot, key.as_ptr(), prev, flags.bits()) };
        if found.is_null() {
            return Ok(None);
        }
        let entry = DictionaryEntry::view(found, slot as usize)?;
        self.entries.track(&entry);
        Ok(Some(entry))
    }

    /// Value of the first entry matching `key`
    pub fn get_value(&self, key: &str, flags: DictFlags) -> Result<Option<String>> {
        Ok(self.get(key, None, flags)?.map(|entry| entry.value().to_string()))
    }

    /// Insert or update `key`; a `None` value removes it
    pub fn set(&self, key: &str, value: Option<&str>, flags: DictFlags) -> Result<()> {
        let key = to_c_string(key, "dictionary key")?;
        let value = value.map(|v| to_c_string(v, "dictionary value")).transpose()?;
        let (_guard, slot) = self.lock()?;
        self.entries.detach_all();
        let value_ptr = value.as_ref().map_or(ptr::null(), |v| v.as_ptr());
        check(
            unsafe { ffi::av_dict_set(slot, key.as_ptr(), value_ptr, flags.bits()) },
            "av_dict_set",
        )?;
        Ok(())
    }

    /// Copy every entry into `other`
    pub fn copy_to(&self, other: &Dictionary, flags: DictFlags) -> Result<()> {
        if ptr::eq(self, other) {
            return Ok(());
        }
        let (src, dst) = lock_pair(self, other);
        let src = src.get(Self::KIND)?;
        let dst = dst.get(Self::KIND)?;
        other.entries.detach_all();
        check(
            unsafe { ffi::av_dict_copy(dst, *src, flags.bits()) },
            "av_dict_copy",
        )?;
        Ok(())
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<()> {
        let (_guard, slot) = self.lock()?;
        self.entries.detach_all();
        unsafe { ffi::av_dict_free(slot) };
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let (_guard, slot) = self.lock()?;
        Ok(unsafe { ffi::av_dict_count(*slot) }.max(0) as usize)
    }

    /// All keys in insertion order, duplicates included
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries()?.into_iter().map(|(k, _)| k).collect())
    }

    /// All key/value pairs in insertion order
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        let (_guard, slot) = self.lock()?;
        let mut pairs = Vec::new();
        let mut entry: *mut ffi::AVDictionaryEntry = ptr::null_mut();
        loop {
            entry = unsafe {
                ffi::av_dict_get(
                    *slot,
                    EMPTY_KEY.as_ptr() as *const c_char,
                    entry,
                    DictFlags::IGNORE_SUFFIX.bits(),
                )
            };
            if entry.is_null() {
                break;
            }
            unsafe { pairs.push((c_string((*entry).key), c_string((*entry).value))) };
        }
        Ok(pairs)
    }

    /// Run `f` with the raw slot, for native calls that read or rewrite the
    /// dictionary (e.g. option consumption in `avcodec_open2`)
    pub(crate) fn with_slot<R>(&self, f: impl FnOnce(*mut Slot) -> R) -> Result<R> {
        let (_guard, slot) = self.lock()?;
        self.entries.detach_all();
        Ok(f(slot))
    }

    fn release(&self) {
        let mut guard = self.slot.lock();
        self.entries.detach_all();
        if let Some((slot, ownership)) = guard.take() {
            resource::unregister(slot as usize, self);
            if ownership == Ownership::Owned {
                unsafe {
                    ffi::av_dict_free(slot);
                    drop(Box::from_raw(slot));
                }
            }
        }
    }
}

impl Resource for Dictionary {
    const KIND: &'static str = "AVDictionary";

    fn ownership(&self) -> Ownership {
        self.slot.lock().ownership()
    }

    fn is_freed(&self) -> bool {
        self.slot.lock().is_null()
    }

    fn free(&self) {
        self.release();
    }

    fn claim_ownership(&self) -> bool {
        // a borrowed slot lives inside its parent and can never be owned
        false
    }
}

impl Dependent for Dictionary {
    fn detach(&self) {
        let mut guard = self.slot.lock();
        self.entries.detach_all();
        if let Some((slot, _)) = guard.take() {
            resource::unregister(slot as usize, self);
        }
    }
}

impl Drop for Dictionary {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock_pair<'a>(
    a: &'a Dictionary,
    b: &'a Dictionary,
) -> (MutexGuard<'a, Native<Slot>>, MutexGuard<'a, Native<Slot>>) {
    if (a as *const Dictionary) < (b as *const Dictionary) {
        let ga = a.slot.lock();
        let gb = b.slot.lock();
        (ga, gb)
    } else {
        let gb = b.slot.lock();
        let ga = a.slot.lock();
        (ga, gb)
    }
}

impl DictionaryEntry {
    fn view(ptr: *mut ffi::AVDictionaryEntry, owner: usize) -> Result<Arc<DictionaryEntry>> {
        resource::wrap(ptr as usize, Ownership::Borrowed, || {
            let (key, value) = unsafe { (c_string((*ptr).key), c_string((*ptr).value)) };
            DictionaryEntry {
                key,
                value,
                handle: Mutex::new(Native::new(ptr, Ownership::Borrowed)),
                owner,
            }
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// The native entry, if still attached to the dictionary whose slot is `owner`
    fn cursor(&self, owner: usize) -> Result<*mut ffi::AVDictionaryEntry> {
        if self.owner != owner {
            return Err(Error::InvalidArgument(
                "entry belongs to a different dictionary".into(),
            ));
        }
        self.handle.lock().get(Self::KIND)
    }
}

impl Resource for DictionaryEntry {
    const KIND: &'static str = "AVDictionaryEntry";

    fn ownership(&self) -> Ownership {
        Ownership::Borrowed
    }

    fn is_freed(&self) -> bool {
        self.handle.lock().is_null()
    }

    /// Entries never own their storage
    fn free(&self) {}

    fn claim_ownership(&self) -> bool {
        false
    }
}

impl Dependent for DictionaryEntry {
    fn detach(&self) {
        if let Some((ptr, _)) = self.handle.lock().take() {
            resource::unregister(ptr as usize, self);
        }
    }
}

impl Drop for DictionaryEntry {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for DictionaryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictionaryEntry")
            .field("key", &self.key)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::HandleTable;

    #[test]
    fn test_set_get_remove() {
        let dict = Dictionary::new().unwrap();
        dict.set("foo", Some("bar"), DictFlags::NONE).unwrap();
        assert_eq!(dict.keys().unwrap(), vec!["foo".to_string()]);

        let entry = dict.get("foo", None, DictFlags::NONE).unwrap().unwrap();
        assert_eq!(entry.key(), "foo");
        assert_eq!(entry.value(), "bar");

        dict.set("foo", None, DictFlags::NONE).unwrap();
        assert!(dict.keys().unwrap().is_empty());
        assert!(dict.get("foo", None, DictFlags::NONE).unwrap().is_none());
    }

    #[test]
    fn test_multikey_iterates_in_insertion_order() {
        let dict = Dictionary::new().unwrap();
        dict.set("k", Some("1"), DictFlags::MULTIKEY).unwrap();
        dict.set("k", Some("2"), DictFlags::MULTIKEY).unwrap();
        dict.set("k", Some("3"), DictFlags::MULTIKEY).unwrap();
        assert_eq!(dict.count().unwrap(), 3);

        let mut values = Vec::new();
        let mut prev: Option<Arc<DictionaryEntry>> = None;
        while let Some(entry) = dict.get("k", prev.as_deref(), DictFlags::NONE).unwrap() {
            values.push(entry.value().to_string());
            prev = Some(entry);
        }
        assert_eq!(values, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_entries_detach_on_mutation() {
        let dict = Dictionary::new().unwrap();
        dict.set("a", Some("1"), DictFlags::NONE).unwrap();
        let entry = dict.get("a", None, DictFlags::NONE).unwrap().unwrap();
        assert!(!entry.is_freed());

        dict.set("b", Some("2"), DictFlags::NONE).unwrap();
        assert!(entry.is_freed());
        assert_eq!(entry.value(), "1");
        assert!(matches!(
            dict.get("b", Some(&*entry), DictFlags::NONE),
            Err(Error::FreedResource(_))
        ));
    }

    #[test]
    fn test_foreign_entry_rejected() {
        let a = Dictionary::new().unwrap();
        let b = Dictionary::new().unwrap();
        a.set("x", Some("1"), DictFlags::NONE).unwrap();
        b.set("x", Some("2"), DictFlags::NONE).unwrap();
        let entry = a.get("x", None, DictFlags::NONE).unwrap().unwrap();
        assert!(matches!(
            b.get("x", Some(&*entry), DictFlags::NONE),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_flags() {
        let dict = Dictionary::new().unwrap();
        dict.set("Key", Some("a"), DictFlags::NONE).unwrap();
        dict.set("Key", Some("b"), DictFlags::DONT_OVERWRITE).unwrap();
        assert_eq!(dict.get_value("key", DictFlags::NONE).unwrap().unwrap(), "a");
        assert!(dict.get_value("key", DictFlags::MATCH_CASE).unwrap().is_none());

        dict.set("Key", Some("c"), DictFlags::APPEND).unwrap();
        assert_eq!(dict.get_value("Key", DictFlags::NONE).unwrap().unwrap(), "ac");
        assert_eq!(
            dict.get_value("K", DictFlags::IGNORE_SUFFIX).unwrap().unwrap(),
            "ac"
        );

        let both = DictFlags::MATCH_CASE | DictFlags::IGNORE_SUFFIX;
        assert!(both.contains(DictFlags::IGNORE_SUFFIX));
        assert_eq!(DictFlags::from_bits_truncate(4 | 8 | 64), DictFlags::MULTIKEY);
    }

    #[test]
    fn test_copy_and_clear() {
        let src = Dictionary::new().unwrap();
        let dst = Dictionary::new().unwrap();
        src.set("a", Some("1"), DictFlags::NONE).unwrap();
        src.set("b", Some("2"), DictFlags::NONE).unwrap();
        dst.set("a", Some("0"), DictFlags::NONE).unwrap();

        src.copy_to(&dst, DictFlags::DONT_OVERWRITE).unwrap();
        assert_eq!(
            dst.entries().unwrap(),
            vec![
                ("a".to_string(), "0".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );

        src.copy_to(&src, DictFlags::NONE).unwrap();
        assert_eq!(src.count().unwrap(), 2);

        dst.clear().unwrap();
        assert_eq!(dst.count().unwrap(), 0);
        dst.set("c", Some("3"), DictFlags::NONE).unwrap();
        assert_eq!(dst.keys().unwrap(), vec!["c".to_string()]);
    }

    #[test]
    fn test_free_is_idempotent() {
        let dict = Dictionary::new().unwrap();
        dict.set("a", Some("1"), DictFlags::NONE).unwrap();
        let entry = dict.get("a", None, DictFlags::NONE).unwrap().unwrap();
        dict.free();
        dict.free();
        assert!(dict.is_freed());
        assert!(entry.is_freed());
        assert!(matches!(dict.count(), Err(Error::FreedResource("AVDictionary"))));
        entry.free();
    }

    #[test]
    fn test_owned_dictionary_is_registered() {
        let dict = Dictionary::new().unwrap();
        let slot = dict.with_slot(|slot| slot as usize).unwrap();
        let found = HandleTable::global().lookup::<Dictionary>(slot).unwrap();
        assert!(Arc::ptr_eq(&found, &dict));
        assert_eq!(found.ownership(), Ownership::Owned);
        drop(found);

        dict.free();
        let after = HandleTable::global().lookup::<Dictionary>(slot);
        assert!(after.map_or(true, |other| !Arc::ptr_eq(&other, &dict)));
    }

    #[test]
    fn test_nul_in_key_rejected() {
        let dict = Dictionary::new().unwrap();
        assert!(matches!(
            dict.set("a\0b", Some("1"), DictFlags::NONE),
            Err(Error::InvalidArgument(_))
        ));
    }
}
