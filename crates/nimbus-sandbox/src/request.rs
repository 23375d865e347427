//! The request view and response builder handed to a tenant script.

/// Upper bound on a script-built response body.
pub const MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Immutable snapshot of the inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: String,
    /// Header names are stored lowercased.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RequestSnapshot {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup. Repeated headers are joined with `, `.
    pub fn header(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }
}

/// Response produced by a completed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl SandboxResponse {
    /// A fixed plain-text response. Used for every synthesized failure so no
    /// internal detail reaches the visitor.
    pub fn plain(status: u16, message: &str) -> Self {
        Self {
            status,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: message.as_bytes().to_vec(),
        }
    }
}

/// Mutable response state owned by one execution.
///
/// `send` is the terminal write: it replaces the body and seals the
/// builder. Every call after sealing, including another `send`, is a no-op.
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    sealed: bool,
}

/// The body would exceed [`MAX_RESPONSE_BODY_BYTES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyTooLarge;

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Codes outside 100..=599 are ignored.
    pub fn set_status(&mut self, code: u16) {
        if self.sealed || !(100..=599).contains(&code) {
            return;
        }
        self.status = Some(code);
    }

    pub fn add_header(&mut self, name: String, value: String) {
        if self.sealed {
            return;
        }
        self.headers.push((name, value));
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BodyTooLarge> {
        if self.sealed {
            return Ok(());
        }
        if self.body.len() + bytes.len() > MAX_RESPONSE_BODY_BYTES {
            return Err(BodyTooLarge);
        }
        self.body.extend_from_slice(bytes);
        Ok(())
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<(), BodyTooLarge> {
        if self.sealed {
            return Ok(());
        }
        if bytes.len() > MAX_RESPONSE_BODY_BYTES {
            return Err(BodyTooLarge);
        }
        self.body = bytes.to_vec();
        self.sealed = true;
        Ok(())
    }

    /// Defaults to 200 with an empty body when the script set nothing.
    pub fn finish(self) -> SandboxResponse {
        SandboxResponse {
            status: self.status.unwrap_or(200),
            headers: self.headers,
            body: self.body,
        }
    }
}
