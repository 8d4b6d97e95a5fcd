//! The message contract between a monitored process and its supervisor.
//!
//! Every message is a fixed [`Header`] followed by `size` payload bytes. The
//! header carries the protocol version; a peer receiving an unknown version
//! rejects the message and closes the connection rather than guessing at the
//! payload layout. Registration and annotation payloads are JSON maps, which
//! is fine as they are only ever produced from a healthy process. The crash
//! notification payload is the fixed-size [`fault_context::CrashEvent`] byte
//! image so the crashing side never allocates.

use crate::Error;
use std::collections::BTreeMap;

/// Version stamped on every message header
pub const PROTOCOL_VERSION: u16 = 1;

/// Client registration, payload is a JSON annotation map
pub const REGISTER: u16 = 0;
/// Registration acknowledgment, payload is a [`SessionId`]
pub const REGISTER_ACK: u16 = 1;
/// Annotation delta, payload is a JSON annotation map merged over the
/// registered one
pub const SET_ANNOTATIONS: u16 = 2;
/// Crash notification, payload is a raw [`fault_context::CrashEvent`]
pub const CRASH: u16 = 3;
/// Capture-complete acknowledgment, empty payload
pub const CRASH_ACK: u16 = 4;
/// Keep-alive request, empty payload
pub const PING: u16 = 5;
/// Keep-alive response, empty payload
pub const PONG: u16 = 6;

/// Client supplied key/value metadata attached to every report
pub type Annotations = BTreeMap<String, String>;

#[derive(Copy, Clone)]
#[cfg_attr(test, derive(PartialEq, Debug))]
#[repr(C)]
pub struct Header {
    pub version: u16,
    pub kind: u16,
    pub size: u32,
}

impl Header {
    #[inline]
    pub fn new(kind: u16, size: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            size,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        #[allow(unsafe_code)]
        unsafe {
            let size = std::mem::size_of::<Self>();
            let ptr = (self as *const Self).cast();
            std::slice::from_raw_parts(ptr, size)
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != std::mem::size_of::<Self>() {
            return None;
        }

        #[allow(unsafe_code)]
        unsafe {
            Some(*buf.as_ptr().cast::<Self>())
        }
    }

    /// Rejects headers stamped with a version this build does not speak.
    #[inline]
    pub fn validate(&self) -> Result<(), Error> {
        if self.version != PROTOCOL_VERSION {
            return Err(Error::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                received: self.version,
            });
        }

        Ok(())
    }
}

/// Payload of a [`REGISTER_ACK`]
#[derive(Copy, Clone, scroll::Pread, scroll::Pwrite, scroll::SizeWith)]
#[cfg_attr(test, derive(PartialEq, Debug))]
pub struct SessionId {
    pub id: u32,
}

pub fn encode_annotations(annotations: &Annotations) -> Result<Vec<u8>, Error> {
    Ok(serde_json::to_vec(annotations)?)
}

pub fn decode_annotations(buf: &[u8]) -> Result<Annotations, Error> {
    Ok(serde_json::from_slice(buf)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use scroll::{Pread, Pwrite, LE};

    #[test]
    fn header_bytes() {
        let expected = Header::new(CRASH, 8 * 1024);
        let exp_bytes = expected.as_bytes();

        let actual = Header::from_bytes(exp_bytes).unwrap();

        assert_eq!(expected, actual);
        assert!(actual.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_version() {
        let header = Header {
            version: PROTOCOL_VERSION + 9,
            kind: REGISTER,
            size: 0,
        };

        assert!(matches!(
            Header::from_bytes(header.as_bytes()).unwrap().validate(),
            Err(Error::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                ..
            })
        ));
    }

    #[test]
    fn session_id_bytes() {
        let expected = SessionId { id: 77 };

        let mut buf = [0u8; 4];
        buf.pwrite_with(expected, 0, LE).unwrap();

        let actual: SessionId = buf.pread_with(0, LE).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn annotation_round_trip() {
        let mut annotations = Annotations::new();
        annotations.insert("ver".to_owned(), "1.0".to_owned());
        annotations.insert("build".to_owned(), "f00dface".to_owned());

        let encoded = encode_annotations(&annotations).unwrap();
        assert_eq!(decode_annotations(&encoded).unwrap(), annotations);
    }
}
