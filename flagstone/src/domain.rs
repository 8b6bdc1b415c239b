use chrono::{DateTime, Utc};
use std::any::{Any, TypeId};
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

/// A value type that flags can be resolved as.
///
/// The variant is the human readable label stored next to the value in the cache.
pub trait FlagValue: Clone + Debug + Send + Sync + 'static {
    fn variant(&self) -> String;
}

macro_rules! display_flag_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FlagValue for $ty {
                fn variant(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

display_flag_value!(bool, i32, i64, u32, u64, f32, f64, String);

impl FlagValue for serde_json::Value {
    fn variant(&self) -> String {
        match self {
            serde_json::Value::Null => "null".to_string(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl<T: FlagValue> FlagValue for Option<T> {
    fn variant(&self) -> String {
        match self {
            Some(value) => value.variant(),
            None => "null".to_string(),
        }
    }
}

/// Composite cache key: flag identifier plus the value type it was resolved as.
///
/// The same flag resolved as `bool` and as `i64` occupies two independent slots.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    flag_key: String,
    type_id: TypeId,
    type_name: &'static str,
}

impl CacheKey {
    pub fn of<T: FlagValue>(flag_key: impl Into<String>) -> Self {
        Self {
            flag_key: flag_key.into(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn flag_key(&self) -> &str {
        &self.flag_key
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.flag_key, self.type_name)
    }
}

/// How a resolved value was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    Cached,
    Retrieved,
    Error,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Cached => "CACHED",
            Reason::Retrieved => "RETRIEVED",
            Reason::Error => "ERROR",
        }
    }
}

impl Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached flag value. Entries are never mutated; a refresh replaces the whole entry.
#[derive(Clone, Debug)]
pub struct CacheEntry<T> {
    value: T,
    variant: String,
    reason: Reason,
    expires_at: DateTime<Utc>,
}

impl<T: FlagValue> CacheEntry<T> {
    /// Entry for a value that was just fetched from the remote source.
    pub fn retrieved(value: T, expires_at: DateTime<Utc>) -> Self {
        let variant = value.variant();
        Self {
            value,
            variant,
            reason: Reason::Retrieved,
            expires_at,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Type-erased view of a `CacheEntry<T>` so entries of every value type can share one store.
pub trait ErasedEntry: Any + Send + Sync + Debug {
    fn expires_at(&self) -> DateTime<Utc>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: FlagValue> ErasedEntry for CacheEntry<T> {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Recover the typed entry. Returns `None` if the stored entry holds a different type.
pub fn downcast_entry<T: FlagValue>(entry: Arc<dyn ErasedEntry>) -> Option<Arc<CacheEntry<T>>> {
    entry.into_any().downcast::<CacheEntry<T>>().ok()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The fetch function failed.
    General,
    /// The caller stopped waiting before the fetch finished.
    Cancelled,
    /// The cache was disposed before the call.
    Disposed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ResolutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of resolving a flag. Always carries a usable value.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution<T> {
    pub value: T,
    pub variant: String,
    pub reason: Reason,
    pub error: Option<ResolutionError>,
}

impl<T: FlagValue> Resolution<T> {
    pub fn cached(entry: &CacheEntry<T>) -> Self {
        Self {
            value: entry.value.clone(),
            variant: entry.variant.clone(),
            reason: Reason::Cached,
            error: None,
        }
    }

    pub fn retrieved(entry: &CacheEntry<T>) -> Self {
        Self {
            value: entry.value.clone(),
            variant: entry.variant.clone(),
            reason: Reason::Retrieved,
            error: None,
        }
    }

    /// Fallback to the caller's default.
    pub fn fallback(default_value: T, error: ResolutionError) -> Self {
        Self {
            value: default_value,
            variant: "error".to_string(),
            reason: Reason::Error,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
