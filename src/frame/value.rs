use bytes::BufMut;
use thiserror::Error;

/// Maximum number of bound values in one statement.
pub const MAX_VALUES: usize = u16::MAX as usize;

/// Bound values of a statement in their wire form.
///
/// Each value is kept the way it goes out on the wire: a 4-byte declared
/// length (-1 = null, -2 = unset) followed by the raw payload. The driver
/// does not interpret the payload, marshalling is the caller's business.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    values_num: u16,
}

/// A single value read back from [`SerializedValues`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawValue<'a> {
    Null,
    Unset,
    Value(&'a [u8]),
}

impl<'a> RawValue<'a> {
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            RawValue::Value(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SerializeValuesError {
    #[error("Too many values to add, max 65535 values can be sent in a request")]
    TooManyValues,
    #[error("Value too big to be sent in a request - max 2GiB is allowed")]
    ValueTooBig,
}

impl SerializedValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        SerializedValues {
            serialized_values: Vec::with_capacity(capacity),
            values_num: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values_num == 0
    }

    pub fn len(&self) -> u16 {
        self.values_num
    }

    pub fn size(&self) -> usize {
        self.serialized_values.len()
    }

    /// Appends a value; `None` is serialized as the CQL `null`.
    pub fn add_value(&mut self, value: Option<&[u8]>) -> Result<(), SerializeValuesError> {
        if self.values_num as usize >= MAX_VALUES {
            return Err(SerializeValuesError::TooManyValues);
        }
        match value {
            Some(bytes) => {
                let len =
                    i32::try_from(bytes.len()).map_err(|_| SerializeValuesError::ValueTooBig)?;
                self.serialized_values.put_i32(len);
                self.serialized_values.put_slice(bytes);
            }
            None => self.serialized_values.put_i32(-1),
        }
        self.values_num += 1;
        Ok(())
    }

    /// Appends the CQL `unset` marker.
    pub fn add_unset_value(&mut self) -> Result<(), SerializeValuesError> {
        if self.values_num as usize >= MAX_VALUES {
            return Err(SerializeValuesError::TooManyValues);
        }
        self.serialized_values.put_i32(-2);
        self.values_num += 1;
        Ok(())
    }

    pub(crate) fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.values_num);
        buf.put_slice(&self.serialized_values);
    }

    pub fn iter(&self) -> impl Iterator<Item = RawValue<'_>> {
        ValueIterator {
            serialized_values: &self.serialized_values,
            remaining: self.values_num,
        }
    }
}

struct ValueIterator<'a> {
    serialized_values: &'a [u8],
    remaining: u16,
}

impl<'a> Iterator for ValueIterator<'a> {
    type Item = RawValue<'a>;

    fn next(&mut self) -> Option<RawValue<'a>> {
        if self.remaining == 0 || self.serialized_values.len() < 4 {
            return None;
        }
        self.remaining -= 1;

        let (len_bytes, rest) = self.serialized_values.split_at(4);
        let len = i32::from_be_bytes(len_bytes.try_into().unwrap());
        match len {
            -2 => {
                self.serialized_values = rest;
                Some(RawValue::Unset)
            }
            l if l < 0 => {
                self.serialized_values = rest;
                Some(RawValue::Null)
            }
            l => {
                let len = l as usize;
                if rest.len() < len {
                    return None;
                }
                let (value, rest) = rest.split_at(len);
                self.serialized_values = rest;
                Some(RawValue::Value(value))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_values() {
        let values = SerializedValues::new();
        assert!(values.is_empty());
        assert_eq!(values.len(), 0);
        assert_eq!(values.iter().count(), 0);

        let mut buf = Vec::new();
        values.write_to_request(&mut buf);
        assert_eq!(buf, vec![0, 0]);
    }

    #[test]
    fn add_and_read_back() {
        let mut values = SerializedValues::new();
        values.add_value(Some(&42i64.to_be_bytes())).unwrap();
        values.add_value(None).unwrap();
        values.add_unset_value().unwrap();
        values.add_value(Some(b"abc")).unwrap();

        let read: Vec<RawValue> = values.iter().collect();
        assert_eq!(
            read,
            vec![
                RawValue::Value(&42i64.to_be_bytes()),
                RawValue::Null,
                RawValue::Unset,
                RawValue::Value(b"abc"),
            ]
        );
    }

    #[test]
    fn wire_layout() {
        let mut values = SerializedValues::new();
        values.add_value(Some(&[1, 2])).unwrap();
        values.add_value(None).unwrap();

        let mut buf = Vec::new();
        values.write_to_request(&mut buf);
        assert_eq!(
            buf,
            vec![
                0, 2, // values count
                0, 0, 0, 2, 1, 2, // first value
                0xFF, 0xFF, 0xFF, 0xFF, // null
            ]
        );
    }
}
