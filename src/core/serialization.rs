//! # Serialization
//!
//! Type-indexed formatter registry for payload encoding.
//!
//! A [`Formatter`] is a `(serialize, deserialize)` pair for one type. The
//! [`FormatterRegistry`] maps `TypeId → formatter` with O(1) lookup, so the
//! serializer stays generic without per-field reflection costs. Formatters
//! for the primitive integer, float, and boolean types plus strings and
//! their nullable wrappers are pre-registered; composites register before
//! startup and the registry is read-only afterwards.
//!
//! ## Encoding rules
//! - Numerics are little-endian, matching the wire header.
//! - Strings are a 16-bit UTF-8 byte count followed by the bytes; the
//!   count `0xFFFF` is the null sentinel, and counts above the formatter's
//!   limit fail with a serialization-limit error.
//! - Nullable values are one flag byte (`0` absent, `1` present) followed
//!   by the inner encoding; any other flag byte is rejected.
//! - Aggregates encode their fields in registration order; a field left
//!   out of the registration is an ignored field.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// 16-bit count value that encodes a null string.
pub const NULL_STRING_SENTINEL: u16 = u16::MAX;

/// Largest encodable string, leaving the sentinel value free.
pub const DEFAULT_MAX_STRING_BYTES: usize = (u16::MAX - 1) as usize;

/// A `(serialize, deserialize)` pair for values of type `T`.
pub trait Formatter<T>: Send + Sync + 'static {
    fn serialize(&self, value: &T, out: &mut BytesMut) -> Result<()>;
    fn deserialize(&self, input: &mut Bytes) -> Result<T>;
}

fn need(input: &Bytes, bytes: usize) -> Result<()> {
    if input.remaining() < bytes {
        return Err(Error::ShortFrame {
            declared: bytes,
            available: input.remaining(),
        });
    }
    Ok(())
}

macro_rules! numeric_formatter {
    ($name:ident, $ty:ty, $size:expr, $put:ident, $get:ident) => {
        struct $name;

        impl Formatter<$ty> for $name {
            fn serialize(&self, value: &$ty, out: &mut BytesMut) -> Result<()> {
                out.$put(*value);
                Ok(())
            }

            fn deserialize(&self, input: &mut Bytes) -> Result<$ty> {
                need(input, $size)?;
                Ok(input.$get())
            }
        }
    };
}

numeric_formatter!(U8Formatter, u8, 1, put_u8, get_u8);
numeric_formatter!(U16Formatter, u16, 2, put_u16_le, get_u16_le);
numeric_formatter!(U32Formatter, u32, 4, put_u32_le, get_u32_le);
numeric_formatter!(U64Formatter, u64, 8, put_u64_le, get_u64_le);
numeric_formatter!(I8Formatter, i8, 1, put_i8, get_i8);
numeric_formatter!(I16Formatter, i16, 2, put_i16_le, get_i16_le);
numeric_formatter!(I32Formatter, i32, 4, put_i32_le, get_i32_le);
numeric_formatter!(I64Formatter, i64, 8, put_i64_le, get_i64_le);
numeric_formatter!(F32Formatter, f32, 4, put_f32_le, get_f32_le);
numeric_formatter!(F64Formatter, f64, 8, put_f64_le, get_f64_le);

struct BoolFormatter;

impl Formatter<bool> for BoolFormatter {
    fn serialize(&self, value: &bool, out: &mut BytesMut) -> Result<()> {
        out.put_u8(u8::from(*value));
        Ok(())
    }

    fn deserialize(&self, input: &mut Bytes) -> Result<bool> {
        need(input, 1)?;
        Ok(input.get_u8() != 0)
    }
}

/// Length-prefixed UTF-8 string formatter with a configurable byte limit.
pub struct StringFormatter {
    max_bytes: usize,
}

impl StringFormatter {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.min(DEFAULT_MAX_STRING_BYTES),
        }
    }

    fn write_count_and_bytes(&self, value: &str, out: &mut BytesMut) -> Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > self.max_bytes {
            return Err(Error::SerializationLimit {
                length: bytes.len(),
                max: self.max_bytes,
            });
        }
        out.put_u16_le(bytes.len() as u16);
        out.put_slice(bytes);
        Ok(())
    }

    fn read_counted(&self, input: &mut Bytes) -> Result<Option<String>> {
        need(input, 2)?;
        let count = input.get_u16_le();
        if count == NULL_STRING_SENTINEL {
            return Ok(None);
        }
        let count = count as usize;
        if count > self.max_bytes {
            return Err(Error::SerializationLimit {
                length: count,
                max: self.max_bytes,
            });
        }
        need(input, count)?;
        let raw = input.split_to(count);
        let text = std::str::from_utf8(&raw).map_err(|_| Error::InvalidUtf8)?;
        Ok(Some(text.to_owned()))
    }
}

impl Default for StringFormatter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STRING_BYTES)
    }
}

impl Formatter<String> for StringFormatter {
    fn serialize(&self, value: &String, out: &mut BytesMut) -> Result<()> {
        self.write_count_and_bytes(value, out)
    }

    fn deserialize(&self, input: &mut Bytes) -> Result<String> {
        // A null sentinel where the schema admits no null.
        self.read_counted(input)?
            .ok_or(Error::InvalidNullable(0xFF))
    }
}

impl Formatter<Option<String>> for StringFormatter {
    fn serialize(&self, value: &Option<String>, out: &mut BytesMut) -> Result<()> {
        match value {
            Some(s) => self.write_count_and_bytes(s, out),
            None => {
                out.put_u16_le(NULL_STRING_SENTINEL);
                Ok(())
            }
        }
    }

    fn deserialize(&self, input: &mut Bytes) -> Result<Option<String>> {
        self.read_counted(input)
    }
}

/// Wraps an inner formatter with a one-byte present/absent flag.
pub struct NullableFormatter<T> {
    inner: Arc<dyn Formatter<T>>,
}

impl<T> NullableFormatter<T> {
    pub fn new(inner: Arc<dyn Formatter<T>>) -> Self {
        Self { inner }
    }
}

impl<T: Send + Sync + 'static> Formatter<Option<T>> for NullableFormatter<T> {
    fn serialize(&self, value: &Option<T>, out: &mut BytesMut) -> Result<()> {
        match value {
            None => {
                out.put_u8(0);
                Ok(())
            }
            Some(inner) => {
                out.put_u8(1);
                self.inner.serialize(inner, out)
            }
        }
    }

    fn deserialize(&self, input: &mut Bytes) -> Result<Option<T>> {
        need(input, 1)?;
        match input.get_u8() {
            0 => Ok(None),
            1 => Ok(Some(self.inner.deserialize(input)?)),
            flag => Err(Error::InvalidNullable(flag)),
        }
    }
}

type EncodeFieldFn<T> = Box<dyn Fn(&T, &mut BytesMut) -> Result<()> + Send + Sync>;
type DecodeFieldFn<T> = Box<dyn Fn(&mut T, &mut Bytes) -> Result<()> + Send + Sync>;

struct FieldCodec<T> {
    encode: EncodeFieldFn<T>,
    decode: DecodeFieldFn<T>,
}

/// Formatter for an aggregate type, built field by field.
///
/// Fields encode in the order they were added; a field never added is an
/// ignored field and contributes nothing to the wire form. Deserialization
/// starts from `T::default()` and applies each field's setter.
pub struct AggregateFormatter<T> {
    fields: Vec<FieldCodec<T>>,
}

impl<T: Default + Send + Sync + 'static> AggregateFormatter<T> {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Add the next field, resolved through the global registry.
    pub fn field<F>(
        mut self,
        get: impl Fn(&T) -> F + Send + Sync + 'static,
        set: impl Fn(&mut T, F) + Send + Sync + 'static,
    ) -> Self
    where
        F: Send + Sync + 'static,
    {
        self.fields.push(FieldCodec {
            encode: Box::new(move |value, out| {
                global_registry().serialize(&get(value), out)
            }),
            decode: Box::new(move |value, input| {
                set(value, global_registry().deserialize::<F>(input)?);
                Ok(())
            }),
        });
        self
    }

    /// Add the next field with an explicit formatter.
    pub fn field_with<F>(
        mut self,
        get: impl Fn(&T) -> F + Send + Sync + 'static,
        set: impl Fn(&mut T, F) + Send + Sync + 'static,
        formatter: Arc<dyn Formatter<F>>,
    ) -> Self
    where
        F: Send + Sync + 'static,
    {
        let encode_fmt = Arc::clone(&formatter);
        self.fields.push(FieldCodec {
            encode: Box::new(move |value, out| encode_fmt.serialize(&get(value), out)),
            decode: Box::new(move |value, input| {
                set(value, formatter.deserialize(input)?);
                Ok(())
            }),
        });
        self
    }
}

impl<T: Default + Send + Sync + 'static> Default for AggregateFormatter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default + Send + Sync + 'static> Formatter<T> for AggregateFormatter<T> {
    fn serialize(&self, value: &T, out: &mut BytesMut) -> Result<()> {
        for field in &self.fields {
            (field.encode)(value, out)?;
        }
        Ok(())
    }

    fn deserialize(&self, input: &mut Bytes) -> Result<T> {
        let mut value = T::default();
        for field in &self.fields {
            (field.decode)(&mut value, input)?;
        }
        Ok(value)
    }
}

/// Type-indexed table of formatters.
///
/// Writes happen at startup; after [`lock`](FormatterRegistry::lock) the
/// table is read-only and every lookup is a read-lock plus hash probe.
pub struct FormatterRegistry {
    table: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    locked: AtomicBool,
}

impl FormatterRegistry {
    /// Create a registry with every primitive formatter pre-registered.
    pub fn new() -> Self {
        let registry = Self {
            table: RwLock::new(HashMap::new()),
            locked: AtomicBool::new(false),
        };

        registry.install::<u8>(Arc::new(U8Formatter));
        registry.install::<u16>(Arc::new(U16Formatter));
        registry.install::<u32>(Arc::new(U32Formatter));
        registry.install::<u64>(Arc::new(U64Formatter));
        registry.install::<i8>(Arc::new(I8Formatter));
        registry.install::<i16>(Arc::new(I16Formatter));
        registry.install::<i32>(Arc::new(I32Formatter));
        registry.install::<i64>(Arc::new(I64Formatter));
        registry.install::<f32>(Arc::new(F32Formatter));
        registry.install::<f64>(Arc::new(F64Formatter));
        registry.install::<bool>(Arc::new(BoolFormatter));
        registry.install::<String>(Arc::new(StringFormatter::default()));
        registry.install::<Option<String>>(Arc::new(StringFormatter::default()));

        registry.install_nullable::<u8>();
        registry.install_nullable::<u16>();
        registry.install_nullable::<u32>();
        registry.install_nullable::<u64>();
        registry.install_nullable::<i8>();
        registry.install_nullable::<i16>();
        registry.install_nullable::<i32>();
        registry.install_nullable::<i64>();
        registry.install_nullable::<f32>();
        registry.install_nullable::<f64>();
        registry.install_nullable::<bool>();

        registry
    }

    fn install<T: 'static>(&self, formatter: Arc<dyn Formatter<T>>) {
        if let Ok(mut table) = self.table.write() {
            table.insert(TypeId::of::<T>(), Box::new(formatter));
        }
    }

    fn install_nullable<T: Send + Sync + 'static>(&self) {
        if let Ok(inner) = self.get::<T>() {
            self.install::<Option<T>>(Arc::new(NullableFormatter::new(inner)));
        }
    }

    /// Register a formatter for `T`. Fails once the registry is locked.
    pub fn register<T: 'static>(&self, formatter: impl Formatter<T>) -> Result<()> {
        if self.locked.load(Ordering::Acquire) {
            return Err(Error::RegistryLocked);
        }
        self.install::<T>(Arc::new(formatter));
        Ok(())
    }

    /// Resolve the formatter for `T`.
    pub fn get<T: 'static>(&self) -> Result<Arc<dyn Formatter<T>>> {
        let table = self
            .table
            .read()
            .map_err(|_| Error::Config("formatter registry lock poisoned".into()))?;
        table
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<Arc<dyn Formatter<T>>>())
            .cloned()
            .ok_or(Error::UnregisteredType(std::any::type_name::<T>()))
    }

    /// Serialize `value` with its registered formatter.
    pub fn serialize<T: 'static>(&self, value: &T, out: &mut BytesMut) -> Result<()> {
        self.get::<T>()?.serialize(value, out)
    }

    /// Deserialize a `T` with its registered formatter.
    pub fn deserialize<T: 'static>(&self, input: &mut Bytes) -> Result<T> {
        self.get::<T>()?.deserialize(input)
    }

    /// Freeze the registry; further registration fails.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

impl Default for FormatterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide registry. The only acceptable process-wide state in the
/// core; locked when the listener starts.
static REGISTRY: once_cell::sync::Lazy<FormatterRegistry> =
    once_cell::sync::Lazy::new(FormatterRegistry::new);

/// The process-wide formatter registry.
pub fn global_registry() -> &'static FormatterRegistry {
    &REGISTRY
}
