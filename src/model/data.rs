use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Write};

/// All data types which can be retrieved
/// from a message tree using the cast! macro
///
/// # Example
/// ```
/// # #[macro_use]
/// # extern crate rdp;
/// # use rdp::model::data::{Message, DataType, Component, U32};
/// # fn main() {
///     let message = component![
///         "header" => U32::LE(1234)
///     ];
///     if let DataType::U32(header) = message["header"].visit() {
///         assert_eq!(header, 1234)
///     }
///     else {
///         panic!("Invalid cast")
///     }
/// # }
/// ```
pub enum DataType<'a> {
    Component(&'a Component),
    Trame(&'a Trame),
    U32(u32),
    U16(u16),
    U8(u8),
    Slice(&'a [u8]),
    None,
}

/// Retrieve a leaf value from a message tree
///
/// # Example
/// ```
/// # #[macro_use]
/// # extern crate rdp;
/// # use rdp::model::data::{DataType, Component, Message, U32};
/// # use rdp::model::error::{Error, RdpError, RdpResult, RdpErrorKind};
/// # fn main() {
///     let message = component![
///         "header" => U32::LE(1234)
///     ];
///     let header = cast!(DataType::U32, message["header"]).unwrap();
///     assert_eq!(header, 1234)
/// # }
/// ```
#[macro_export]
macro_rules! cast {
    ($ident:path, $expr:expr) => {
        match $expr.visit() {
            $ident(e) => Ok(e),
            _ => Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidCast,
                "Invalid Cast",
            ))),
        }
    };
}

/// A son can inform its parent of a particular
/// parsing behavior through one of these options,
/// returned by the options method of the Message trait
pub enum MessageOption {
    /// Skip a field during read
    SkipField(String),
    /// Limit the read of the named field
    /// to a dedicated buffer of the announced size
    Size(String, usize),
    /// No particular option
    None,
}

/// All wire elements are messages
///
/// A message knows how to read itself from a stream,
/// write itself to a stream, compute its encoded length
/// and expose its value to a visitor
pub trait Message: Send {
    /// Write the current element into a writable stream
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()>;

    /// Read and mutate the current element from a readable stream
    fn read(&mut self, reader: &mut dyn Read) -> RdpResult<()>;

    /// Length in bytes of the encoded element
    fn length(&self) -> u64;

    /// Visitor pattern to retrieve the inner value
    fn visit(&self) -> DataType;

    /// Message options inspected by the parent node
    fn options(&self) -> MessageOption;
}

/// u8 is a message
///
/// # Example
/// ```
/// use rdp::model::data::Message;
/// let mut x = 0_u8;
/// let mut stream = std::io::Cursor::new(vec![4]);
/// x.read(&mut stream).unwrap();
/// assert_eq!(x, 4)
/// ```
impl Message for u8 {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        Ok(writer.write_u8(*self)?)
    }

    fn read(&mut self, reader: &mut dyn Read) -> RdpResult<()> {
        *self = reader.read_u8()?;
        Ok(())
    }

    fn length(&self) -> u64 {
        1
    }

    fn visit(&self) -> DataType {
        DataType::U8(*self)
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

/// A raw byte payload
///
/// An empty vector will consume all remaining bytes of
/// the stream, a non empty vector will read exactly its
/// current length
impl Message for Vec<u8> {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        writer.write_all(self)?;
        Ok(())
    }

    fn read(&mut self, reader: &mut dyn Read) -> RdpResult<()> {
        if self.is_empty() {
            reader.read_to_end(self)?;
        } else {
            reader.read_exact(self)?;
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.len() as u64
    }

    fn visit(&self) -> DataType {
        DataType::Slice(self.as_slice())
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

/// An integer with an explicit endianness on the wire
#[derive(Copy, Clone)]
pub enum Value<Type> {
    /// Little endian
    LE(Type),
    /// Big endian
    BE(Type),
}

impl<Type: Copy + PartialEq> Value<Type> {
    /// Return the inner value whatever the endianness
    ///
    /// # Example
    /// ```
    /// use rdp::model::data::U32;
    /// let x = U32::LE(4);
    /// assert_eq!(x.inner(), 4)
    /// ```
    pub fn inner(&self) -> Type {
        match self {
            Value::<Type>::LE(e) | Value::<Type>::BE(e) => *e,
        }
    }
}

impl<Type: Copy + PartialEq> PartialEq for Value<Type> {
    fn eq(&self, other: &Self) -> bool {
        self.inner() == other.inner()
    }
}

pub type U16 = Value<u16>;

impl Message for U16 {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        match self {
            U16::LE(value) => writer.write_u16::<LittleEndian>(*value)?,
            U16::BE(value) => writer.write_u16::<BigEndian>(*value)?,
        };
        Ok(())
    }

    fn read(&mut self, reader: &mut dyn Read) -> RdpResult<()> {
        match self {
            U16::LE(value) => *value = reader.read_u16::<LittleEndian>()?,
            U16::BE(value) => *value = reader.read_u16::<BigEndian>()?,
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        2
    }

    fn visit(&self) -> DataType {
        DataType::U16(self.inner())
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

pub type U32 = Value<u32>;

impl Message for U32 {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        match self {
            U32::LE(value) => writer.write_u32::<LittleEndian>(*value)?,
            U32::BE(value) => writer.write_u32::<BigEndian>(*value)?,
        };
        Ok(())
    }

    fn read(&mut self, reader: &mut dyn Read) -> RdpResult<()> {
        match self {
            U32::LE(value) => *value = reader.read_u32::<LittleEndian>()?,
            U32::BE(value) => *value = reader.read_u32::<BigEndian>()?,
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        4
    }

    fn visit(&self) -> DataType {
        DataType::U32(self.inner())
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

/// An ordered sequence of messages without names
pub type Trame = Vec<Box<dyn Message>>;

/// Build an anonymous sequence of messages
///
/// # Example
/// ```
/// # #[macro_use]
/// # extern crate rdp;
/// # use rdp::model::data::{Message, U16, U32, Trame};
/// # fn main() {
///     let mut trame = trame![U16::LE(0), U32::LE(0)];
///     assert_eq!(trame.length(), 6)
/// # }
/// ```
#[macro_export]
macro_rules! trame {
    () => { Trame::new() };
    ($( $val: expr ),* $(,)?) => {{
        let mut vec = Trame::new();
        $( vec.push(Box::new($val)); )*
        vec
    }};
}

impl Message for Trame {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        for v in self {
            v.write(writer)?;
        }
        Ok(())
    }

    fn read(&mut self, reader: &mut dyn Read) -> RdpResult<()> {
        for v in self {
            v.read(reader)?;
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.iter().map(|v| v.length()).sum()
    }

    fn visit(&self) -> DataType {
        DataType::Trame(self)
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

/// An ordered sequence of named messages
///
/// Components honor the options announced by their sons,
/// which allows conditional fields and length-bounded reads
pub type Component = IndexMap<String, Box<dyn Message>>;

#[macro_export]
macro_rules! component {
    () => { Component::new() };
    ($( $key: expr => $val: expr ),* $(,)?) => {{
        let mut map = Component::new();
        $( map.insert(String::from($key), Box::new($val) as Box<dyn Message>); )*
        map
    }};
}

impl Message for Component {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        let mut filtering_key = HashSet::new();
        for (name, value) in self.iter() {
            if filtering_key.contains(name) {
                continue;
            }
            value.write(writer)?;
            if let MessageOption::SkipField(field) = value.options() {
                filtering_key.insert(field);
            }
        }
        Ok(())
    }

    fn read(&mut self, reader: &mut dyn Read) -> RdpResult<()> {
        let mut filtering_key = HashSet::new();
        let mut dynamic_size = HashMap::new();
        for (name, value) in self.iter_mut() {
            if filtering_key.contains(name) {
                continue;
            }
            if dynamic_size.contains_key(name) {
                let mut local = vec![0; dynamic_size[name]];
                reader.read_exact(&mut local)?;
                value.read(&mut Cursor::new(local))?;
            } else {
                value.read(reader)?;
            }

            match value.options() {
                MessageOption::SkipField(field) => {
                    filtering_key.insert(field);
                }
                MessageOption::Size(field, size) => {
                    dynamic_size.insert(field, size);
                }
                MessageOption::None => (),
            }
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        let mut sum: u64 = 0;
        let mut filtering_key = HashSet::new();
        for (name, value) in self.iter() {
            if filtering_key.contains(name) {
                continue;
            }
            sum += value.length();
            if let MessageOption::SkipField(field) = value.options() {
                filtering_key.insert(field);
            }
        }
        sum
    }

    fn visit(&self) -> DataType {
        DataType::Component(self)
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

/// A constant valued field
///
/// During read the parsed value is compared against the
/// expected one and an InvalidConst error is raised on
/// mismatch
///
/// # Example
/// ```
/// use rdp::model::data::{Message, Check, U16};
/// use std::io::Cursor;
/// let mut stream = Cursor::new(vec![4, 0]);
/// let mut x = Check::new(U16::LE(4));
/// x.read(&mut stream).unwrap();
/// ```
pub struct Check<T> {
    value: T,
}

impl<T> Check<T> {
    pub fn new(value: T) -> Self {
        Check { value }
    }
}

impl<T: Message + Clone + PartialEq> Message for Check<T> {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        self.value.write(writer)
    }

    fn read(&mut self, reader: &mut dyn Read) -> RdpResult<()> {
        let expected = self.value.clone();
        self.value.read(reader)?;
        if expected != self.value {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidConst,
                "Invalid constness of data",
            )));
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.value.length()
    }

    fn visit(&self) -> DataType {
        self.value.visit()
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

pub type DynOptionFnSend<T> = dyn Fn(&T) -> MessageOption + Send;

/// A message whose options depend on its current value
///
/// This is the way length prefixed payloads are expressed:
/// the length field announces a Size option for the payload
/// field
///
/// # Example
/// ```
/// # #[macro_use]
/// # extern crate rdp;
/// # use rdp::model::data::{Message, Component, DynOption, MessageOption, U16};
/// # use std::io::Cursor;
/// # fn main() {
///     let mut message = component![
///         "size" => DynOption::new(U16::LE(0), |size| MessageOption::Size("payload".to_string(), size.inner() as usize)),
///         "payload" => Vec::<u8>::new()
///     ];
///     let mut stream = Cursor::new(vec![2, 0, 1, 2, 3]);
///     message.read(&mut stream).unwrap();
///     assert_eq!(message.length(), 4)
/// # }
/// ```
pub struct DynOption<T> {
    inner: T,
    filter: Box<DynOptionFnSend<T>>,
}

impl<T> DynOption<T> {
    pub fn new<F: 'static>(inner: T, filter: F) -> Self
    where
        F: Fn(&T) -> MessageOption + Send,
    {
        DynOption {
            inner,
            filter: Box::new(filter),
        }
    }
}

impl<T: Message> Message for DynOption<T> {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        self.inner.write(writer)
    }

    fn read(&mut self, reader: &mut dyn Read) -> RdpResult<()> {
        self.inner.read(reader)
    }

    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn visit(&self) -> DataType {
        self.inner.visit()
    }

    fn options(&self) -> MessageOption {
        (self.filter)(&self.inner)
    }
}

/// Serialize a message into a fresh byte vector
///
/// # Example
/// ```
/// # #[macro_use]
/// # extern crate rdp;
/// # use rdp::model::data::{to_vec, Message, U32, Trame};
/// # fn main() {
///     let x = trame![U32::LE(1)];
///     assert_eq!(to_vec(&x), [1, 0, 0, 0])
/// # }
/// ```
pub fn to_vec(message: &dyn Message) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::with_capacity(message.length() as usize));
    message.write(&mut buffer).unwrap();
    buffer.into_inner()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_component_ordering() {
        let message = component![
            "first" => U16::LE(1),
            "second" => U32::LE(2),
            "third" => 3_u8
        ];
        assert_eq!(to_vec(&message), [1, 0, 2, 0, 0, 0, 3]);
    }

    #[test]
    fn test_dyn_option_size() {
        let mut message = component![
            "size" => DynOption::new(U16::LE(0), |size| MessageOption::Size("payload".to_string(), size.inner() as usize)),
            "payload" => Vec::<u8>::new(),
            "trailer" => U16::LE(0)
        ];
        let mut stream = Cursor::new(vec![3, 0, 9, 9, 9, 7, 0]);
        message.read(&mut stream).unwrap();
        assert_eq!(cast!(DataType::Slice, message["payload"]).unwrap(), [9, 9, 9]);
        assert_eq!(cast!(DataType::U16, message["trailer"]).unwrap(), 7);
    }

    #[test]
    fn test_dyn_option_skip() {
        let mut message = component![
            "flag" => DynOption::new(U16::LE(0), |flag| {
                if flag.inner() == 0 {
                    MessageOption::SkipField("optional".to_string())
                } else {
                    MessageOption::None
                }
            }),
            "optional" => U32::LE(0)
        ];
        let mut stream = Cursor::new(vec![0, 0]);
        message.read(&mut stream).unwrap();
        assert_eq!(message.length(), 2);
    }

    #[test]
    fn test_check_invalid_const() {
        let mut message = Check::new(U16::LE(0x10));
        let mut stream = Cursor::new(vec![0, 0]);
        assert!(message.read(&mut stream).is_err());
    }

    #[test]
    fn test_nested_component() {
        let mut message = component![
            "header" => component![
                "length" => U16::LE(0)
            ],
            "payload" => vec![0_u8; 2]
        ];
        let mut stream = Cursor::new(vec![4, 0, 1, 2]);
        message.read(&mut stream).unwrap();
        let header = cast!(DataType::Component, message["header"]).unwrap();
        assert_eq!(cast!(DataType::U16, header["length"]).unwrap(), 4);
    }

    #[test]
    fn test_u16_be() {
        let mut x = U16::BE(0);
        x.read(&mut Cursor::new(vec![1, 2])).unwrap();
        assert_eq!(x.inner(), 0x0102);
        assert_eq!(to_vec(&x), [1, 2]);
    }
}
