//! Owned HTTP request model.
//!
//! Requests own their storage: setters copy the caller's bytes, so the
//! caller's buffers can be reused or freed immediately.

use bytes::Bytes;

use crate::error::HttpError;

/// One header name/value pair, owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: Bytes,
    pub value: Bytes,
}

impl Header {
    pub fn new(name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        Self {
            name: Bytes::copy_from_slice(name.as_ref()),
            value: Bytes::copy_from_slice(value.as_ref()),
        }
    }
}

/// An HTTP request under construction.
#[derive(Debug, Clone, Default)]
pub struct Request {
    method: Option<Bytes>,
    path: Option<Bytes>,
    headers: Vec<Header>,
    body: Bytes,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_method(&mut self, method: impl AsRef<[u8]>) {
        self.method = Some(Bytes::copy_from_slice(method.as_ref()));
    }

    /// Fails with `DataNotAvailable` until a method has been set.
    pub fn method(&self) -> Result<&Bytes, HttpError> {
        self.method.as_ref().ok_or(HttpError::DataNotAvailable)
    }

    pub fn set_path(&mut self, path: impl AsRef<[u8]>) {
        self.path = Some(Bytes::copy_from_slice(path.as_ref()));
    }

    /// Fails with `DataNotAvailable` until a path has been set.
    pub fn path(&self) -> Result<&Bytes, HttpError> {
        self.path.as_ref().ok_or(HttpError::DataNotAvailable)
    }

    pub fn add_header(&mut self, header: Header) {
        self.headers.push(header);
    }

    pub fn header(&self, index: usize) -> Result<&Header, HttpError> {
        self.headers.get(index).ok_or(HttpError::InvalidIndex)
    }

    /// Remove the header at `index`; later headers shift left.
    pub fn erase_header(&mut self, index: usize) -> Result<(), HttpError> {
        if index >= self.headers.len() {
            return Err(HttpError::InvalidIndex);
        }
        self.headers.remove(index);
        Ok(())
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}
