use std::fmt;

/// Headers with a well-known meaning to the reply machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownHeader {
    ContentType,
    ContentLength,
    Location,
    LastModified,
    Cookie,
    SetCookie,
    ContentDisposition,
    UserAgent,
    Server,
    IfModifiedSince,
    ETag,
    IfMatch,
    IfNoneMatch,
}

impl KnownHeader {
    pub fn name(self) -> &'static str {
        match self {
            KnownHeader::ContentType => "Content-Type",
            KnownHeader::ContentLength => "Content-Length",
            KnownHeader::Location => "Location",
            KnownHeader::LastModified => "Last-Modified",
            KnownHeader::Cookie => "Cookie",
            KnownHeader::SetCookie => "Set-Cookie",
            KnownHeader::ContentDisposition => "Content-Disposition",
            KnownHeader::UserAgent => "User-Agent",
            KnownHeader::Server => "Server",
            KnownHeader::IfModifiedSince => "If-Modified-Since",
            KnownHeader::ETag => "ETag",
            KnownHeader::IfMatch => "If-Match",
            KnownHeader::IfNoneMatch => "If-None-Match",
        }
    }
}

impl fmt::Display for KnownHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered header list with case-insensitive lookup.
///
/// Names keep the casing they were inserted with. A name may appear more
/// than once (e.g. `Set-Cookie`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawHeaders {
    entries: Vec<(String, String)>,
}

impl RawHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every value under `name` with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn to_vec(&self) -> Vec<(String, String)> {
        self.entries.clone()
    }

    /// `Content-Length`, when present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        self.get(KnownHeader::ContentLength.name())
            .and_then(|v| v.trim().parse().ok())
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for RawHeaders {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = RawHeaders::new();
        for (n, v) in iter {
            headers.append(n, v);
        }
        headers
    }
}
