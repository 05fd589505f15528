//! Typed replies decoded from the server's byte stream

use bytes::Bytes;

/// One flat reply frame
///
/// Multibulk replies carry only their child count; the children follow as
/// separate replies in the same stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Error (-ERR message\r\n)
    Error(Bytes),
    /// Status, usually "OK" (+OK\r\n)
    Status(Bytes),
    /// Null bulk ($-1\r\n)
    BulkNil,
    /// Bulk payload ($5\r\nhello\r\n)
    Bulk(Bytes),
    /// Null multibulk (*-1\r\n)
    MultibulkNil,
    /// Multibulk header (*2\r\n), followed by that many child replies
    Multibulk(usize),
    /// Integer (:123\r\n)
    Integer(i64),
}

impl Reply {
    pub fn is_multibulk(&self) -> bool {
        matches!(self, Reply::Multibulk(_))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::BulkNil | Reply::MultibulkNil)
    }

    /// Number of child replies owed after this one
    pub fn child_count(&self) -> usize {
        match self {
            Reply::Multibulk(count) => *count,
            _ => 0,
        }
    }

    /// Payload of a value-carrying reply, `None` for nil replies
    ///
    /// Status and bulk payloads are returned verbatim. Integers are rendered
    /// in their decimal wire form. Returns `Err(self)` for replies without a
    /// byte value (errors and multibulk headers).
    pub fn into_value(self) -> Result<Option<Bytes>, Reply> {
        match self {
            Reply::Status(data) | Reply::Bulk(data) => Ok(Some(data)),
            Reply::BulkNil | Reply::MultibulkNil => Ok(None),
            Reply::Integer(n) => Ok(Some(Bytes::from(n.to_string()))),
            other => Err(other),
        }
    }

    /// Short name used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Reply::Error(_) => "error",
            Reply::Status(_) => "status",
            Reply::BulkNil => "bulk nil",
            Reply::Bulk(_) => "bulk",
            Reply::MultibulkNil => "multibulk nil",
            Reply::Multibulk(_) => "multibulk",
            Reply::Integer(_) => "integer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_value() {
        assert_eq!(
            Reply::Bulk(Bytes::from_static(b"\xffraw")).into_value(),
            Ok(Some(Bytes::from_static(b"\xffraw")))
        );
        assert_eq!(Reply::BulkNil.into_value(), Ok(None));
        assert_eq!(
            Reply::Integer(-42).into_value(),
            Ok(Some(Bytes::from_static(b"-42")))
        );
        assert_eq!(Reply::Multibulk(2).into_value(), Err(Reply::Multibulk(2)));
    }

    #[test]
    fn test_child_count() {
        assert_eq!(Reply::Multibulk(3).child_count(), 3);
        assert_eq!(Reply::MultibulkNil.child_count(), 0);
        assert!(Reply::MultibulkNil.is_nil());
        assert!(!Reply::Status(Bytes::from_static(b"OK")).is_nil());
    }
}
