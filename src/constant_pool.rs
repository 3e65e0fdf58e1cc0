//! Random-access view over a serialized class file constant pool.

use crate::error::ConstantPoolError;

pub(crate) const CONSTANT_UTF8: u8 = 1;
pub(crate) const CONSTANT_INTEGER: u8 = 3;
pub(crate) const CONSTANT_FLOAT: u8 = 4;
pub(crate) const CONSTANT_LONG: u8 = 5;
pub(crate) const CONSTANT_DOUBLE: u8 = 6;
pub(crate) const CONSTANT_CLASS: u8 = 7;
pub(crate) const CONSTANT_STRING: u8 = 8;
pub(crate) const CONSTANT_FIELDREF: u8 = 9;
pub(crate) const CONSTANT_METHODREF: u8 = 10;
pub(crate) const CONSTANT_INTERFACE_METHODREF: u8 = 11;
pub(crate) const CONSTANT_NAME_AND_TYPE: u8 = 12;
pub(crate) const CONSTANT_METHOD_HANDLE: u8 = 15;
pub(crate) const CONSTANT_METHOD_TYPE: u8 = 16;
pub(crate) const CONSTANT_DYNAMIC: u8 = 17;
pub(crate) const CONSTANT_INVOKE_DYNAMIC: u8 = 18;
pub(crate) const CONSTANT_MODULE: u8 = 19;
pub(crate) const CONSTANT_PACKAGE: u8 = 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RefKind {
    Field,
    Method,
    InterfaceMethod,
}

/// Constant pool entry. `Null` fills slot 0, the second slot of wide
/// constants and any slot whose tag was not recognized.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ConstantPoolEntry {
    Null,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(u16),
    String(u16),
    NameAndType { name: u16, descriptor: u16 },
    MemberRef {
        kind: RefKind,
        class: u16,
        name_and_type: u16,
    },
    MethodHandle(Vec<u8>),
    MethodType(Vec<u8>),
    Dynamic { tag: u8, raw: Vec<u8> },
    Module(u16),
    Package(u16),
}

impl ConstantPoolEntry {
    fn kind_name(&self) -> &'static str {
        match self {
            ConstantPoolEntry::Null => "Null",
            ConstantPoolEntry::Utf8(_) => "Utf8",
            ConstantPoolEntry::Integer(_) => "Integer",
            ConstantPoolEntry::Float(_) => "Float",
            ConstantPoolEntry::Long(_) => "Long",
            ConstantPoolEntry::Double(_) => "Double",
            ConstantPoolEntry::Class(_) => "Class",
            ConstantPoolEntry::String(_) => "String",
            ConstantPoolEntry::NameAndType { .. } => "NameAndType",
            ConstantPoolEntry::MemberRef { .. } => "MemberRef",
            ConstantPoolEntry::MethodHandle(_) => "MethodHandle",
            ConstantPoolEntry::MethodType(_) => "MethodType",
            ConstantPoolEntry::Dynamic { .. } => "Dynamic",
            ConstantPoolEntry::Module(_) => "Module",
            ConstantPoolEntry::Package(_) => "Package",
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ConstantPool {
    entries: Vec<ConstantPoolEntry>,
    description: String,
}

impl ConstantPool {
    /// Parse the entries of a constant pool as delivered by the debuggee:
    /// tagged entries back to back, without the leading count.
    pub(crate) fn parse(bytes: &[u8], description: impl Into<String>) -> ConstantPool {
        let description = description.into();
        let mut entries = vec![ConstantPoolEntry::Null];
        let mut offset = 0;
        while offset < bytes.len() {
            match read_entry(bytes, offset, &description) {
                Some((entry, next)) => {
                    let wide = matches!(
                        entry,
                        ConstantPoolEntry::Long(_) | ConstantPoolEntry::Double(_)
                    );
                    entries.push(entry);
                    if wide {
                        entries.push(ConstantPoolEntry::Null);
                    }
                    offset = next;
                }
                None => break,
            }
        }
        ConstantPool {
            entries,
            description,
        }
    }

    /// Parse a counted pool as laid out in a class file (`count` is the
    /// `constant_pool_count` field). Returns the pool and the number of bytes
    /// consumed.
    pub(crate) fn read_counted(
        bytes: &[u8],
        count: u16,
        description: impl Into<String>,
    ) -> Option<(ConstantPool, usize)> {
        let description = description.into();
        let mut entries = vec![ConstantPoolEntry::Null];
        let mut offset = 0;
        while entries.len() < count as usize {
            let tag = *bytes.get(offset)?;
            if entry_len(tag, bytes, offset).is_none() {
                // Without a known layout the rest of the class file is unreadable.
                tracing::warn!(tag, offset, %description, "unknown constant pool tag");
                return None;
            }
            let (entry, next) = read_entry(bytes, offset, &description)?;
            let wide = matches!(
                entry,
                ConstantPoolEntry::Long(_) | ConstantPoolEntry::Double(_)
            );
            entries.push(entry);
            if wide {
                entries.push(ConstantPoolEntry::Null);
            }
            offset = next;
        }
        Some((
            ConstantPool {
                entries,
                description,
            },
            offset,
        ))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entry(&self, index: usize) -> Result<&ConstantPoolEntry, ConstantPoolError> {
        self.entries
            .get(index)
            .ok_or_else(|| ConstantPoolError::IndexOutOfBounds {
                index,
                size: self.entries.len(),
                description: self.description.clone(),
            })
    }

    pub(crate) fn utf8(&self, index: usize) -> Result<&str, ConstantPoolError> {
        match self.entry(index)? {
            ConstantPoolEntry::Utf8(text) => Ok(text),
            other => Err(self.unexpected(index, other, "Utf8")),
        }
    }

    /// Name of the method or field referenced by the member ref at `index`.
    pub(crate) fn method_name(&self, index: usize) -> Result<&str, ConstantPoolError> {
        let (name, _) = self.name_and_type(index)?;
        self.utf8(name as usize)
    }

    /// Descriptor of the method or field referenced by the member ref at `index`.
    pub(crate) fn method_descriptor(&self, index: usize) -> Result<&str, ConstantPoolError> {
        let (_, descriptor) = self.name_and_type(index)?;
        self.utf8(descriptor as usize)
    }

    /// Binary name of the class owning the member ref at `index`.
    pub(crate) fn class_name(&self, index: usize) -> Result<&str, ConstantPoolError> {
        let class = match self.entry(index)? {
            ConstantPoolEntry::MemberRef { class, .. } => *class,
            other => return Err(self.unexpected(index, other, "MemberRef")),
        };
        match self.entry(class as usize)? {
            ConstantPoolEntry::Class(name) => self.utf8(*name as usize),
            other => Err(self.unexpected(class as usize, other, "Class")),
        }
    }

    fn name_and_type(&self, index: usize) -> Result<(u16, u16), ConstantPoolError> {
        let name_and_type = match self.entry(index)? {
            ConstantPoolEntry::MemberRef { name_and_type, .. } => *name_and_type,
            other => return Err(self.unexpected(index, other, "MemberRef")),
        };
        match self.entry(name_and_type as usize)? {
            ConstantPoolEntry::NameAndType { name, descriptor } => Ok((*name, *descriptor)),
            other => Err(self.unexpected(name_and_type as usize, other, "NameAndType")),
        }
    }

    fn unexpected(
        &self,
        index: usize,
        found: &ConstantPoolEntry,
        expected: &'static str,
    ) -> ConstantPoolError {
        ConstantPoolError::UnexpectedEntry {
            index,
            found: found.kind_name(),
            expected,
            description: self.description.clone(),
        }
    }
}

/// Byte length of the entry starting at `offset`, tag included.
fn entry_len(tag: u8, bytes: &[u8], offset: usize) -> Option<usize> {
    let len = match tag {
        CONSTANT_UTF8 => 3 + read_u16(bytes, offset + 1)? as usize,
        CONSTANT_INTEGER | CONSTANT_FLOAT => 5,
        CONSTANT_LONG | CONSTANT_DOUBLE => 9,
        CONSTANT_CLASS | CONSTANT_STRING | CONSTANT_METHOD_TYPE => 3,
        CONSTANT_MODULE | CONSTANT_PACKAGE => 3,
        CONSTANT_FIELDREF | CONSTANT_METHODREF | CONSTANT_INTERFACE_METHODREF => 5,
        CONSTANT_NAME_AND_TYPE | CONSTANT_DYNAMIC | CONSTANT_INVOKE_DYNAMIC => 5,
        CONSTANT_METHOD_HANDLE => 4,
        _ => return None,
    };
    Some(len)
}

/// Read one entry. Unknown tags produce a `Null` entry and advance by one
/// byte; a truncated entry ends the pool.
fn read_entry(
    bytes: &[u8],
    offset: usize,
    description: &str,
) -> Option<(ConstantPoolEntry, usize)> {
    let tag = *bytes.get(offset)?;
    let Some(len) = entry_len(tag, bytes, offset) else {
        tracing::warn!(tag, offset, %description, "unknown constant pool tag");
        return Some((ConstantPoolEntry::Null, offset + 1));
    };
    let Some(body) = bytes.get(offset + 1..offset + len) else {
        tracing::warn!(tag, offset, %description, "truncated constant pool entry");
        return None;
    };
    let u16_at = |at: usize| u16::from_be_bytes([body[at], body[at + 1]]);
    let u32_at =
        |at: usize| u32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);
    let entry = match tag {
        CONSTANT_UTF8 => ConstantPoolEntry::Utf8(decode_modified_utf8(&body[2..])),
        CONSTANT_INTEGER => ConstantPoolEntry::Integer(u32_at(0) as i32),
        CONSTANT_FLOAT => ConstantPoolEntry::Float(f32::from_bits(u32_at(0))),
        CONSTANT_LONG => {
            ConstantPoolEntry::Long(((u64::from(u32_at(0)) << 32) | u64::from(u32_at(4))) as i64)
        }
        CONSTANT_DOUBLE => ConstantPoolEntry::Double(f64::from_bits(
            (u64::from(u32_at(0)) << 32) | u64::from(u32_at(4)),
        )),
        CONSTANT_CLASS => ConstantPoolEntry::Class(u16_at(0)),
        CONSTANT_STRING => ConstantPoolEntry::String(u16_at(0)),
        CONSTANT_FIELDREF | CONSTANT_METHODREF | CONSTANT_INTERFACE_METHODREF => {
            let kind = match tag {
                CONSTANT_FIELDREF => RefKind::Field,
                CONSTANT_METHODREF => RefKind::Method,
                _ => RefKind::InterfaceMethod,
            };
            ConstantPoolEntry::MemberRef {
                kind,
                class: u16_at(0),
                name_and_type: u16_at(2),
            }
        }
        CONSTANT_NAME_AND_TYPE => ConstantPoolEntry::NameAndType {
            name: u16_at(0),
            descriptor: u16_at(2),
        },
        CONSTANT_METHOD_HANDLE => ConstantPoolEntry::MethodHandle(body.to_vec()),
        CONSTANT_METHOD_TYPE => ConstantPoolEntry::MethodType(body.to_vec()),
        CONSTANT_DYNAMIC | CONSTANT_INVOKE_DYNAMIC => ConstantPoolEntry::Dynamic {
            tag,
            raw: body.to_vec(),
        },
        CONSTANT_MODULE => ConstantPoolEntry::Module(u16_at(0)),
        _ => ConstantPoolEntry::Package(u16_at(0)),
    };
    Some((entry, offset + len))
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let slice = bytes.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([slice[0], slice[1]]))
}

/// Decode the class file flavour of UTF-8: NUL is encoded on two bytes and
/// supplementary characters as surrogate pairs of three bytes each.
fn decode_modified_utf8(bytes: &[u8]) -> String {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let first = bytes[index];
        if first & 0x80 == 0 {
            units.push(u16::from(first));
            index += 1;
        } else if first & 0xe0 == 0xc0 && index + 1 < bytes.len() {
            let unit = (u16::from(first & 0x1f) << 6) | u16::from(bytes[index + 1] & 0x3f);
            units.push(unit);
            index += 2;
        } else if first & 0xf0 == 0xe0 && index + 2 < bytes.len() {
            let unit = (u16::from(first & 0x0f) << 12)
                | (u16::from(bytes[index + 1] & 0x3f) << 6)
                | u16::from(bytes[index + 2] & 0x3f);
            units.push(unit);
            index += 3;
        } else {
            units.push(0xfffd);
            index += 1;
        }
    }
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builder for synthetic pools, shared with matcher tests.
    pub(crate) struct PoolBuilder {
        bytes: Vec<u8>,
        next_index: u16,
    }

    impl PoolBuilder {
        pub(crate) fn new() -> Self {
            PoolBuilder {
                bytes: Vec::new(),
                next_index: 1,
            }
        }

        fn push(&mut self, tag: u8, body: &[u8], slots: u16) -> u16 {
            let index = self.next_index;
            self.bytes.push(tag);
            self.bytes.extend_from_slice(body);
            self.next_index += slots;
            index
        }

        pub(crate) fn utf8(&mut self, text: &str) -> u16 {
            let mut body = (text.len() as u16).to_be_bytes().to_vec();
            body.extend_from_slice(text.as_bytes());
            self.push(CONSTANT_UTF8, &body, 1)
        }

        pub(crate) fn class(&mut self, name: &str) -> u16 {
            let name = self.utf8(name);
            self.push(CONSTANT_CLASS, &name.to_be_bytes(), 1)
        }

        pub(crate) fn long(&mut self, value: i64) -> u16 {
            self.push(CONSTANT_LONG, &value.to_be_bytes(), 2)
        }

        pub(crate) fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
            let class = self.class(owner);
            let name = self.utf8(name);
            let descriptor = self.utf8(descriptor);
            let mut nat = name.to_be_bytes().to_vec();
            nat.extend_from_slice(&descriptor.to_be_bytes());
            let nat = self.push(CONSTANT_NAME_AND_TYPE, &nat, 1);
            let mut body = class.to_be_bytes().to_vec();
            body.extend_from_slice(&nat.to_be_bytes());
            self.push(CONSTANT_METHODREF, &body, 1)
        }

        pub(crate) fn raw(&mut self, bytes: &[u8]) {
            self.bytes.extend_from_slice(bytes);
            self.next_index += 1;
        }

        pub(crate) fn bytes(&self) -> &[u8] {
            &self.bytes
        }

        pub(crate) fn build(&self) -> ConstantPool {
            ConstantPool::parse(&self.bytes, "Test.java")
        }
    }

    #[test]
    fn method_refs_resolve_names_and_descriptors() {
        let mut builder = PoolBuilder::new();
        let refs = [
            builder.method_ref("a/B", "foo", "()V"),
            builder.method_ref("a/B", "bar", "(I)Ljava/lang/String;"),
            builder.method_ref("c/D", "<init>", "(JJ)V"),
        ];
        let pool = builder.build();

        assert_eq!("foo", pool.method_name(refs[0] as usize).expect("foo"));
        assert_eq!("()V", pool.method_descriptor(refs[0] as usize).expect("foo desc"));
        assert_eq!("bar", pool.method_name(refs[1] as usize).expect("bar"));
        assert_eq!(
            "(I)Ljava/lang/String;",
            pool.method_descriptor(refs[1] as usize).expect("bar desc")
        );
        assert_eq!("<init>", pool.method_name(refs[2] as usize).expect("init"));
        assert_eq!("c/D", pool.class_name(refs[2] as usize).expect("owner"));
    }

    #[test]
    fn index_zero_is_null() {
        let pool = PoolBuilder::new().build();
        assert_eq!(&ConstantPoolEntry::Null, pool.entry(0).expect("slot 0"));
        assert_eq!(1, pool.len());
    }

    #[test]
    fn wide_constants_take_two_slots() {
        let mut builder = PoolBuilder::new();
        let long = builder.long(-5);
        let after = builder.utf8("after");
        let pool = builder.build();

        assert_eq!(&ConstantPoolEntry::Long(-5), pool.entry(long as usize).expect("long"));
        assert_eq!(
            &ConstantPoolEntry::Null,
            pool.entry(long as usize + 1).expect("second slot")
        );
        assert_eq!("after", pool.utf8(after as usize).expect("utf8"));
    }

    #[test]
    fn out_of_range_lookup_reports_description() {
        let mut builder = PoolBuilder::new();
        builder.utf8("x");
        let pool = builder.build();

        let error = pool.method_name(9).expect_err("out of bounds");

        assert_eq!(
            ConstantPoolError::IndexOutOfBounds {
                index: 9,
                size: 2,
                description: "Test.java".to_string(),
            },
            error
        );
    }

    #[test]
    fn unknown_tag_becomes_placeholder() {
        let mut builder = PoolBuilder::new();
        builder.raw(&[99]);
        let name = builder.utf8("kept");
        let pool = builder.build();

        assert_eq!(&ConstantPoolEntry::Null, pool.entry(1).expect("placeholder"));
        assert_eq!("kept", pool.utf8(name as usize).expect("utf8"));
    }

    #[test]
    fn non_ref_entry_is_rejected() {
        let mut builder = PoolBuilder::new();
        let text = builder.utf8("plain");
        let pool = builder.build();

        let error = pool.method_name(text as usize).expect_err("not a ref");

        assert!(matches!(error, ConstantPoolError::UnexpectedEntry { .. }));
    }

    #[test]
    fn modified_utf8_decodes_nul_and_supplementary_characters() {
        // U+0000 as C0 80, U+00E9 and U+1F600 as a surrogate pair.
        let bytes = [
            0xc0, 0x80, 0xc3, 0xa9, 0xed, 0xa0, 0xbd, 0xed, 0xb8, 0x80,
        ];
        assert_eq!("\u{0}\u{e9}\u{1f600}", decode_modified_utf8(&bytes));
    }

    #[test]
    fn counted_pool_reports_consumed_length() {
        let mut builder = PoolBuilder::new();
        builder.method_ref("a/B", "foo", "()V");
        let mut bytes = builder.bytes().to_vec();
        let consumed = bytes.len();
        bytes.extend_from_slice(&[0xca, 0xfe]);

        let (pool, len) = ConstantPool::read_counted(&bytes, builder.next_index, "A.class")
            .expect("counted pool");

        assert_eq!(consumed, len);
        assert_eq!(builder.next_index as usize, pool.len());
    }
}
